//! Tagged property values.
//!
//! Properties carry values from a small closed set of types: double,
//! integer, boolean, string, byte vector, and complex double. An
//! extension tag carries arbitrary user payloads behind a trait object.
//! The [`PropPayload`] trait bridges concrete Rust types to and from the
//! tagged representation; the per-type tag [`PropType`] gives O(1) type
//! identity checks without touching the value.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Type tag for a property value. Fixed at property creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropType {
    Double,
    Int,
    Bool,
    String,
    Bytes,
    ComplexDouble,
    Extension,
}

impl fmt::Display for PropType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropType::Double => "double",
            PropType::Int => "int",
            PropType::Bool => "bool",
            PropType::String => "string",
            PropType::Bytes => "bytes",
            PropType::ComplexDouble => "complex-double",
            PropType::Extension => "extension",
        };
        f.write_str(name)
    }
}

/// User-defined payloads carried through the `Extension` tag.
///
/// Implementors supply their own equality so that the dirty tracking
/// (dirty iff the value changed) keeps working for extension values.
pub trait ExtensionValue: fmt::Debug + 'static {
    fn as_any(&self) -> &dyn Any;
    fn eq_dyn(&self, other: &dyn ExtensionValue) -> bool;
}

/// A cheaply clonable handle to an extension payload.
#[derive(Debug, Clone)]
pub struct ExtValue(Arc<dyn ExtensionValue>);

impl ExtValue {
    pub fn new<T: ExtensionValue>(value: T) -> Self {
        ExtValue(Arc::new(value))
    }

    /// Downcasts to the concrete payload type, if it matches.
    pub fn downcast_ref<T: ExtensionValue>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }
}

impl PartialEq for ExtValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_dyn(other.0.as_ref())
    }
}

/// A property value, tagged with its type.
#[derive(Debug, Clone)]
pub enum PropValue {
    Double(f64),
    Int(i64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    ComplexDouble(Complex64),
    Extension(ExtValue),
}

impl PropValue {
    /// Returns the type tag of this value.
    pub fn prop_type(&self) -> PropType {
        match self {
            PropValue::Double(_) => PropType::Double,
            PropValue::Int(_) => PropType::Int,
            PropValue::Bool(_) => PropType::Bool,
            PropValue::String(_) => PropType::String,
            PropValue::Bytes(_) => PropType::Bytes,
            PropValue::ComplexDouble(_) => PropType::ComplexDouble,
            PropValue::Extension(_) => PropType::Extension,
        }
    }

    /// Returns `true` if `other` carries the same type tag.
    pub fn same_type(&self, other: &PropValue) -> bool {
        self.prop_type() == other.prop_type()
    }
}

impl PartialEq for PropValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropValue::Double(a), PropValue::Double(b)) => a == b,
            (PropValue::Int(a), PropValue::Int(b)) => a == b,
            (PropValue::Bool(a), PropValue::Bool(b)) => a == b,
            (PropValue::String(a), PropValue::String(b)) => a == b,
            (PropValue::Bytes(a), PropValue::Bytes(b)) => a == b,
            (PropValue::ComplexDouble(a), PropValue::ComplexDouble(b)) => a == b,
            (PropValue::Extension(a), PropValue::Extension(b)) => a == b,
            _ => false,
        }
    }
}

/// Bridges a concrete Rust type to and from the tagged value set.
///
/// Implemented for the closed set of built-in payload types plus
/// [`ExtValue`] for user extensions.
pub trait PropPayload: Clone + PartialEq + fmt::Debug + 'static {
    /// The tag this payload maps to.
    const TYPE: PropType;

    fn into_value(self) -> PropValue;
    fn from_value(value: &PropValue) -> Option<Self>;
}

macro_rules! impl_prop_payload {
    ($ty:ty, $variant:ident) => {
        impl PropPayload for $ty {
            const TYPE: PropType = PropType::$variant;

            fn into_value(self) -> PropValue {
                PropValue::$variant(self)
            }

            fn from_value(value: &PropValue) -> Option<Self> {
                match value {
                    PropValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_prop_payload!(f64, Double);
impl_prop_payload!(i64, Int);
impl_prop_payload!(bool, Bool);
impl_prop_payload!(String, String);
impl_prop_payload!(Vec<u8>, Bytes);
impl_prop_payload!(Complex64, ComplexDouble);
impl_prop_payload!(ExtValue, Extension);
