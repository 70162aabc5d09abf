//! Property cells.
//!
//! A property is a typed, named, origin-tagged value with dirty/clean
//! tracking and an advisory access mode. The access modes are enforced
//! per operation, not per thread: the engine grants write access around
//! each resolver invocation and restores the previous mode on every exit
//! path via [`ScopedAccess`].
//!
//! The always-dirty sentinel used to force resolvers to run on every
//! resolution pass is a [`Property`] in a special mode: permanently
//! dirty, never valid, never equal to anything, and refusing all reads,
//! writes and forwards.

use crate::error::CoreError;
use crate::source::SourceInfo;
use crate::value::{PropPayload, PropType, PropValue};

/// Advisory access mode for a property.
///
/// Reading requires at least `ReadOnly`; writing requires `ReadWrite` or
/// `ReadWriteLocked`. `ReadWriteLocked` is granted by the engine to a
/// resolver output that an earlier resolver in the same pass already
/// wrote: an equal-value write is accepted, a write that would change
/// the value is a resolution conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    None,
    ReadOnly,
    ReadWrite,
    ReadWriteLocked,
}

/// Identifier of the always-dirty sentinel.
pub const ALWAYS_DIRTY_ID: &str = "__ALWAYS_DIRTY__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropMode {
    Regular,
    AlwaysDirty,
}

/// A single property cell.
#[derive(Debug)]
pub struct Property {
    id: String,
    src: SourceInfo,
    ty: PropType,
    value: PropValue,
    dirty: bool,
    valid: bool,
    access: Access,
    mode: PropMode,
}

impl Property {
    /// Creates a property with an initial value. Creation counts as the
    /// first write: the property is born valid and dirty, so the next
    /// resolution pass picks it up.
    pub(crate) fn new(id: impl Into<String>, src: SourceInfo, initial: PropValue) -> Self {
        Property {
            id: id.into(),
            src,
            ty: initial.prop_type(),
            value: initial,
            dirty: true,
            valid: true,
            access: Access::ReadOnly,
            mode: PropMode::Regular,
        }
    }

    /// Creates the always-dirty sentinel.
    pub(crate) fn dirtifier() -> Self {
        Property {
            id: ALWAYS_DIRTY_ID.into(),
            src: SourceInfo::framework(),
            ty: PropType::Bool,
            value: PropValue::Bool(true),
            dirty: true,
            valid: false,
            access: Access::None,
            mode: PropMode::AlwaysDirty,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn src(&self) -> SourceInfo {
        self.src
    }

    pub fn ty(&self) -> PropType {
        self.ty
    }

    pub fn is_dirty(&self) -> bool {
        self.mode == PropMode::AlwaysDirty || self.dirty
    }

    pub fn is_valid(&self) -> bool {
        self.mode != PropMode::AlwaysDirty && self.valid
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub(crate) fn is_dirtifier(&self) -> bool {
        self.mode == PropMode::AlwaysDirty
    }

    /// Raw view of the current value, without an access check. Used for
    /// equality tests and for forwarding snapshots.
    pub fn value(&self) -> &PropValue {
        &self.value
    }

    /// Sets the access mode. The sentinel never grants access.
    pub(crate) fn set_access(&mut self, access: Access) {
        if self.mode == PropMode::AlwaysDirty {
            return;
        }
        self.access = access;
    }

    /// Reads the value as `T`. Requires at least read access and a
    /// matching type.
    pub fn read<T: PropPayload>(&self) -> Result<T, CoreError> {
        if self.access == Access::None {
            return Err(CoreError::AccessViolation {
                id: self.id.clone(),
                access: self.access,
                op: "read",
            });
        }
        if self.ty != T::TYPE {
            return Err(CoreError::TypeMismatch {
                id: self.id.clone(),
                registered: self.ty,
                requested: T::TYPE,
            });
        }
        Ok(T::from_value(&self.value).expect("tag matched but extraction failed"))
    }

    /// Writes a new value. Requires write access and a matching type.
    /// An unequal write marks the property dirty; an equal write leaves
    /// the flags untouched. Under `ReadWriteLocked`, a write that would
    /// change the value is a resolution conflict.
    pub(crate) fn write(&mut self, value: PropValue) -> Result<(), CoreError> {
        match self.access {
            Access::ReadWrite | Access::ReadWriteLocked => {}
            _ => {
                return Err(CoreError::AccessViolation {
                    id: self.id.clone(),
                    access: self.access,
                    op: "write",
                })
            }
        }
        if value.prop_type() != self.ty {
            return Err(CoreError::TypeMismatch {
                id: self.id.clone(),
                registered: self.ty,
                requested: value.prop_type(),
            });
        }
        if value != self.value {
            if self.access == Access::ReadWriteLocked {
                return Err(CoreError::Resolve {
                    reason: format!(
                        "conflicting write to locked property `{}` (already resolved this pass)",
                        self.id
                    ),
                });
            }
            self.value = value;
            self.dirty = true;
            self.valid = true;
        }
        Ok(())
    }

    /// True if `other` has the same type and an equal value. The
    /// sentinel compares equal to nothing, not even itself.
    pub fn equal(&self, other: &Property) -> bool {
        if self.mode == PropMode::AlwaysDirty || other.mode == PropMode::AlwaysDirty {
            return false;
        }
        self.ty == other.ty && self.value == other.value
    }

    /// Marks the property clean. A no-op for the sentinel.
    pub(crate) fn mark_clean(&mut self) {
        if self.mode == PropMode::AlwaysDirty {
            return;
        }
        self.dirty = false;
    }

    /// Marks the property dirty without changing its value.
    pub(crate) fn force_dirty(&mut self) {
        self.dirty = true;
    }
}

/// RAII access grant: restores the previous access mode when dropped,
/// so the mode is released on every exit path.
pub(crate) struct ScopedAccess<'a> {
    prop: &'a mut Property,
    prev: Access,
}

impl<'a> ScopedAccess<'a> {
    pub(crate) fn grant(prop: &'a mut Property, access: Access) -> Self {
        let prev = prop.access();
        prop.set_access(access);
        ScopedAccess { prop, prev }
    }

    pub(crate) fn prop(&mut self) -> &mut Property {
        self.prop
    }
}

impl Drop for ScopedAccess<'_> {
    fn drop(&mut self) {
        self.prop.set_access(self.prev);
    }
}
