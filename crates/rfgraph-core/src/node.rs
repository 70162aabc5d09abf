//! Graph nodes.
//!
//! A node owns a registry of properties, an ordered list of property
//! resolvers, action handlers, and forwarding policies for properties
//! and actions it does not know about. The graph drives the node through
//! the crate-internal entry points (`init_props`, `resolve_props`,
//! `clean_props`, `forward_edge_property`, `receive_action`); user code
//! talks to the node through the registration API and, for a node that
//! has been moved into a graph, through the graph's property and action
//! entry points.
//!
//! Resolvers reference properties through copyable [`PropKey`] handles
//! and receive a [`PropContext`] granting access-checked reads and
//! writes. The engine grants write access to a resolver's declared
//! outputs around each invocation and restores read-only access on every
//! exit path.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::action::Action;
use crate::error::CoreError;
use crate::graph::ActionOutbox;
use crate::property::{Access, Property, ScopedAccess};
use crate::source::{SourceInfo, SourceKind};
use crate::value::{PropPayload, PropValue};

/// What a node does with an unknown edge property or an unknown action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardingPolicy {
    /// Forward to the opposite port with the same index.
    OneToOne,
    /// Fan out to all opposite-direction ports.
    OneToFan,
    /// Forward to all input ports.
    OneToAllIn,
    /// Forward to all output ports.
    OneToAllOut,
    /// Forward to all ports of both directions.
    OneToAll,
    /// Propagation ends here.
    Drop,
}

/// Handle to a property registered on a node.
///
/// Keys are only meaningful on the node that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropKey(pub(crate) usize);

/// A property resolver: runs when at least one of its inputs is dirty,
/// and may write to its declared outputs.
pub type ResolverFn = Box<dyn FnMut(&mut PropContext<'_>) -> Result<(), CoreError>>;

/// An action handler. Receives the node, the port the action arrived on,
/// the action itself, and an outbox for posting follow-up actions.
pub type ActionHandler =
    Rc<dyn Fn(&Node, SourceInfo, &Action, &mut ActionOutbox<'_>) -> Result<(), CoreError>>;

struct Resolver {
    inputs: Vec<PropKey>,
    outputs: Vec<PropKey>,
    func: ResolverFn,
}

/// Snapshot of an edge property taken before forwarding it into a
/// neighbour, so the source node is no longer borrowed while the
/// neighbour is updated.
#[derive(Debug, Clone)]
pub(crate) struct PropSnapshot {
    pub(crate) id: String,
    pub(crate) src: SourceInfo,
    pub(crate) value: PropValue,
}

/// Access-checked view of a node's properties handed to resolvers.
pub struct PropContext<'a> {
    node_id: &'a str,
    props: &'a mut [Property],
}

impl PropContext<'_> {
    fn slot(&self, key: PropKey) -> Result<&Property, CoreError> {
        self.props.get(key.0).ok_or_else(|| CoreError::Lookup {
            node: self.node_id.to_string(),
            src: SourceInfo::framework(),
            id: format!("<prop key {}>", key.0),
        })
    }

    fn slot_mut(&mut self, key: PropKey) -> Result<&mut Property, CoreError> {
        if key.0 >= self.props.len() {
            return Err(CoreError::Lookup {
                node: self.node_id.to_string(),
                src: SourceInfo::framework(),
                id: format!("<prop key {}>", key.0),
            });
        }
        Ok(&mut self.props[key.0])
    }

    /// Reads a property. Requires at least read access.
    pub fn get<T: PropPayload>(&self, key: PropKey) -> Result<T, CoreError> {
        self.slot(key)?.read()
    }

    /// Writes a property. Requires write access, which the engine grants
    /// only on the resolver's declared outputs.
    pub fn set<T: PropPayload>(&mut self, key: PropKey, value: T) -> Result<(), CoreError> {
        self.slot_mut(key)?.write(value.into_value())
    }

    /// Returns whether the property is currently dirty.
    pub fn is_dirty(&self, key: PropKey) -> Result<bool, CoreError> {
        Ok(self.slot(key)?.is_dirty())
    }

    pub(crate) fn value(&self, key: PropKey) -> Result<PropValue, CoreError> {
        Ok(self.slot(key)?.value().clone())
    }

    pub(crate) fn set_value(&mut self, key: PropKey, value: PropValue) -> Result<(), CoreError> {
        self.slot_mut(key)?.write(value)
    }
}

/// A unit of signal processing with ports, properties, resolvers, and
/// action handlers.
pub struct Node {
    unique_id: String,
    num_inputs: usize,
    num_outputs: usize,
    /// Property arena; slot 0 is the always-dirty sentinel.
    props: Vec<Property>,
    /// (source, id) -> arena slot, in registration order.
    prop_index: IndexMap<(SourceInfo, String), PropKey>,
    resolvers: Vec<Resolver>,
    clean_callbacks: HashMap<usize, Box<dyn FnMut()>>,
    prop_fwd_policies: HashMap<String, ForwardingPolicy>,
    action_fwd_policies: HashMap<String, ForwardingPolicy>,
    action_handlers: HashMap<String, ActionHandler>,
    topology_check: Option<Box<dyn Fn(&[usize], &[usize]) -> bool>>,
}

impl Node {
    /// Key of the always-dirty sentinel. A resolver that lists this key
    /// among its inputs runs on every resolution pass.
    pub const ALWAYS_DIRTY: PropKey = PropKey(0);

    pub fn new(unique_id: impl Into<String>, num_inputs: usize, num_outputs: usize) -> Self {
        let mut prop_fwd_policies = HashMap::new();
        prop_fwd_policies.insert(String::new(), ForwardingPolicy::OneToOne);
        let mut action_fwd_policies = HashMap::new();
        action_fwd_policies.insert(String::new(), ForwardingPolicy::OneToOne);
        Node {
            unique_id: unique_id.into(),
            num_inputs,
            num_outputs,
            props: vec![Property::dirtifier()],
            prop_index: IndexMap::new(),
            resolvers: Vec::new(),
            clean_callbacks: HashMap::new(),
            prop_fwd_policies,
            action_fwd_policies,
            action_handlers: HashMap::new(),
            topology_check: None,
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Registers a property with an initial value.
    ///
    /// Returns [`CoreError::KeyCollision`] if a property with the same
    /// (source, id) pair is already registered.
    pub fn register_property<T: PropPayload>(
        &mut self,
        id: &str,
        src: SourceInfo,
        initial: T,
    ) -> Result<PropKey, CoreError> {
        self.insert_property(id, src, initial.into_value())
    }

    /// Like [`register_property`](Self::register_property), additionally
    /// installing a callback invoked whenever the engine transitions the
    /// property from dirty to clean.
    pub fn register_property_with_callback<T: PropPayload>(
        &mut self,
        id: &str,
        src: SourceInfo,
        initial: T,
        clean_callback: impl FnMut() + 'static,
    ) -> Result<PropKey, CoreError> {
        let key = self.insert_property(id, src, initial.into_value())?;
        self.clean_callbacks.insert(key.0, Box::new(clean_callback));
        Ok(key)
    }

    fn insert_property(
        &mut self,
        id: &str,
        src: SourceInfo,
        value: PropValue,
    ) -> Result<PropKey, CoreError> {
        let index_key = (src, id.to_string());
        if self.prop_index.contains_key(&index_key) {
            return Err(CoreError::KeyCollision {
                node: self.unique_id.clone(),
                src,
                id: id.to_string(),
            });
        }
        let key = PropKey(self.props.len());
        self.props.push(Property::new(id, src, value));
        self.prop_index.insert(index_key, key);
        Ok(key)
    }

    /// Adds a property resolver.
    ///
    /// All referenced keys must belong to this node; the sentinel key is
    /// always accepted. Resolvers run in registration order.
    pub fn add_property_resolver(
        &mut self,
        inputs: Vec<PropKey>,
        outputs: Vec<PropKey>,
        func: impl FnMut(&mut PropContext<'_>) -> Result<(), CoreError> + 'static,
    ) -> Result<(), CoreError> {
        for key in inputs.iter().chain(outputs.iter()) {
            if key.0 >= self.props.len() {
                return Err(CoreError::Lookup {
                    node: self.unique_id.clone(),
                    src: SourceInfo::framework(),
                    id: format!("<prop key {}>", key.0),
                });
            }
        }
        self.resolvers.push(Resolver {
            inputs,
            outputs,
            func: Box::new(func),
        });
        Ok(())
    }

    /// Sets the forwarding policy for unknown edge properties with the
    /// given id; the empty string sets the default. Policies only affect
    /// properties that are not yet registered when they first arrive.
    pub fn set_prop_forwarding_policy(&mut self, policy: ForwardingPolicy, prop_id: &str) {
        self.prop_fwd_policies.insert(prop_id.to_string(), policy);
    }

    /// Sets the forwarding policy for unhandled actions with the given
    /// key; the empty string sets the default.
    pub fn set_action_forwarding_policy(&mut self, policy: ForwardingPolicy, action_key: &str) {
        self.action_fwd_policies
            .insert(action_key.to_string(), policy);
    }

    /// Policy lookup: exact id first, then the default entry.
    pub fn prop_forwarding_policy(&self, prop_id: &str) -> ForwardingPolicy {
        lookup_policy(&self.prop_fwd_policies, prop_id)
    }

    /// Policy lookup: exact key first, then the default entry.
    pub fn action_forwarding_policy(&self, action_key: &str) -> ForwardingPolicy {
        lookup_policy(&self.action_fwd_policies, action_key)
    }

    /// Registers a handler for actions with the given key, overwriting
    /// any previous handler for that key.
    pub fn register_action_handler(
        &mut self,
        key: &str,
        handler: impl Fn(&Node, SourceInfo, &Action, &mut ActionOutbox<'_>) -> Result<(), CoreError>
            + 'static,
    ) {
        self.action_handlers
            .insert(key.to_string(), Rc::new(handler));
    }

    /// Overrides the topology predicate. The default requires every
    /// declared port to be connected; components that permit sparse
    /// connections install a laxer check.
    pub fn set_topology_check(
        &mut self,
        check: impl Fn(&[usize], &[usize]) -> bool + 'static,
    ) {
        self.topology_check = Some(Box::new(check));
    }

    /// Checks whether the node can operate with the given sets of
    /// connected input and output ports.
    pub fn check_topology(&self, connected_inputs: &[usize], connected_outputs: &[usize]) -> bool {
        match &self.topology_check {
            Some(check) => check(connected_inputs, connected_outputs),
            None => {
                connected_inputs.len() == self.num_inputs
                    && connected_outputs.len() == self.num_outputs
            }
        }
    }

    // -----------------------------------------------------------------------
    // User property API (standalone nodes)
    // -----------------------------------------------------------------------

    /// Sets a user property and resolves this node locally. For a node
    /// that has been moved into a graph, use the graph's `set_property`,
    /// which triggers a graph-wide resolution instead.
    pub fn set_property<T: PropPayload>(
        &mut self,
        id: &str,
        value: T,
        instance: usize,
    ) -> Result<(), CoreError> {
        self.write_user_property(id, value, instance)?;
        self.resolve_props()?;
        self.clean_props();
        Ok(())
    }

    /// Reads a user property, resolving this node locally first. Not a
    /// pure accessor.
    pub fn get_property<T: PropPayload>(
        &mut self,
        id: &str,
        instance: usize,
    ) -> Result<T, CoreError> {
        self.resolve_props()?;
        self.clean_props();
        self.read_user_property(id, instance)
    }

    /// Lists the ids of all registered user properties, in registration
    /// order.
    pub fn user_property_ids(&self) -> Vec<String> {
        self.prop_index
            .keys()
            .filter(|(src, _)| src.kind == SourceKind::User)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Reads any registered property without resolving. Useful for
    /// inspecting edge properties.
    pub fn property<T: PropPayload>(&self, src: SourceInfo, id: &str) -> Result<T, CoreError> {
        let key = self.find_property(src, id).ok_or_else(|| CoreError::Lookup {
            node: self.unique_id.clone(),
            src,
            id: id.to_string(),
        })?;
        self.props[key.0].read()
    }

    /// Returns whether a registered property is dirty, or `None` if no
    /// such property exists.
    pub fn property_is_dirty(&self, src: SourceInfo, id: &str) -> Option<bool> {
        self.find_property(src, id).map(|k| self.props[k.0].is_dirty())
    }

    /// Marks a registered property dirty without changing its value,
    /// forcing its resolvers to run on the next resolution.
    pub fn mark_property_dirty(&mut self, src: SourceInfo, id: &str) -> Result<(), CoreError> {
        let key = self.find_property(src, id).ok_or_else(|| CoreError::Lookup {
            node: self.unique_id.clone(),
            src,
            id: id.to_string(),
        })?;
        self.props[key.0].force_dirty();
        Ok(())
    }

    /// Lists every dirty property whose source is not the framework.
    pub fn dirty_property_ids(&self) -> Vec<(SourceInfo, String)> {
        self.props
            .iter()
            .filter(|p| p.is_dirty() && p.src().kind != SourceKind::Framework)
            .map(|p| (p.src(), p.id().to_string()))
            .collect()
    }

    pub(crate) fn write_user_property<T: PropPayload>(
        &mut self,
        id: &str,
        value: T,
        instance: usize,
    ) -> Result<(), CoreError> {
        let src = SourceInfo::user_at(instance);
        let key = self.find_property(src, id).ok_or_else(|| CoreError::Lookup {
            node: self.unique_id.clone(),
            src,
            id: id.to_string(),
        })?;
        let mut guard = ScopedAccess::grant(&mut self.props[key.0], Access::ReadWrite);
        guard.prop().write(value.into_value())
    }

    pub(crate) fn read_user_property<T: PropPayload>(
        &self,
        id: &str,
        instance: usize,
    ) -> Result<T, CoreError> {
        self.property(SourceInfo::user_at(instance), id)
    }

    pub(crate) fn find_property(&self, src: SourceInfo, id: &str) -> Option<PropKey> {
        self.prop_index.get(&(src, id.to_string())).copied()
    }

    pub(crate) fn props(&self) -> &[Property] {
        &self.props
    }

    pub(crate) fn has_dirty_props(&self) -> bool {
        self.props
            .iter()
            .any(|p| p.is_dirty() && p.src().kind != SourceKind::Framework)
    }

    fn port_exists(&self, src: SourceInfo) -> bool {
        match src.kind {
            SourceKind::InputEdge => src.instance < self.num_inputs,
            SourceKind::OutputEdge => src.instance < self.num_outputs,
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Engine entry points
    // -----------------------------------------------------------------------

    /// Runs every resolver once to bring the node into a consistent
    /// state, then marks all properties clean. Invoked by the graph when
    /// the node is added; inconsistent defaults surface as a resolve
    /// error.
    pub fn init_props(&mut self) -> Result<(), CoreError> {
        let Node {
            unique_id,
            props,
            resolvers,
            ..
        } = self;
        let written = HashSet::new();
        for resolver in resolvers.iter_mut() {
            run_resolver(resolver, props, unique_id, &written)
                .map_err(|e| as_resolve_error(unique_id, e))?;
        }
        self.clean_props();
        Ok(())
    }

    /// Runs every resolver that has at least one dirty input, in
    /// registration order. Dirtiness is sampled once on entry, so a
    /// resolver dirtying a property does not trigger further resolvers
    /// within the same call. An output already written by an earlier
    /// resolver in this call is granted locked write access, so a later
    /// conflicting write fails the resolution. Does not mark anything
    /// clean.
    pub(crate) fn resolve_props(&mut self) -> Result<(), CoreError> {
        let Node {
            unique_id,
            props,
            resolvers,
            ..
        } = self;
        let dirty: Vec<bool> = props.iter().map(|p| p.is_dirty()).collect();
        let mut written: HashSet<usize> = HashSet::new();
        for resolver in resolvers.iter_mut() {
            let triggered = resolver.inputs.iter().any(|k| dirty[k.0]);
            if !triggered {
                continue;
            }
            run_resolver(resolver, props, unique_id, &written)
                .map_err(|e| as_resolve_error(unique_id, e))?;
            written.extend(resolver.outputs.iter().map(|k| k.0));
        }
        Ok(())
    }

    /// Marks every property clean, firing clean callbacks on each
    /// dirty-to-clean transition. The sentinel stays dirty.
    pub(crate) fn clean_props(&mut self) {
        let Node {
            props,
            clean_callbacks,
            ..
        } = self;
        for (slot, prop) in props.iter_mut().enumerate() {
            if prop.is_dirty() && !prop.is_dirtifier() {
                prop.mark_clean();
                if let Some(cb) = clean_callbacks.get_mut(&slot) {
                    cb();
                }
            }
        }
    }

    /// Accepts an edge property forwarded from a neighbouring node.
    ///
    /// `incoming` is a snapshot of the neighbour's property;
    /// `incoming_port` is the port on this node the value arrives at.
    /// An unknown property triggers dynamic injection according to the
    /// node's forwarding policy for that id.
    pub(crate) fn forward_edge_property(
        &mut self,
        incoming: &PropSnapshot,
        incoming_port: usize,
    ) -> Result<(), CoreError> {
        let landing = SourceInfo::new(incoming.src.kind.invert_edge(), incoming_port);
        let key = match self.find_property(landing, &incoming.id) {
            Some(key) => key,
            None => match self.inject_edge_property(&incoming.id, landing, &incoming.value)? {
                Some(key) => key,
                None => return Ok(()),
            },
        };
        let prop = &mut self.props[key.0];
        if prop.ty() != incoming.value.prop_type() {
            return Err(CoreError::TypeMismatch {
                id: incoming.id.clone(),
                registered: prop.ty(),
                requested: incoming.value.prop_type(),
            });
        }
        let mut guard = ScopedAccess::grant(prop, Access::ReadWrite);
        guard.prop().write(incoming.value.clone())
    }

    /// Creates the properties implied by the node's forwarding policy
    /// for an unknown edge property, plus a resolver that copies the
    /// landing property into each counterpart on subsequent passes.
    ///
    /// Returns the key of the landing property, or `None` if the policy
    /// drops the value at this hop.
    fn inject_edge_property(
        &mut self,
        id: &str,
        landing: SourceInfo,
        value: &PropValue,
    ) -> Result<Option<PropKey>, CoreError> {
        let policy = self.prop_forwarding_policy(id);
        trace!(
            node = %self.unique_id,
            prop = id,
            ?policy,
            "injecting dynamic edge property at {}",
            landing
        );
        let counterparts: Vec<SourceInfo> = match policy {
            ForwardingPolicy::Drop => return Ok(None),
            ForwardingPolicy::OneToOne => {
                let opposite = landing.inverted();
                if !self.port_exists(opposite) {
                    // No opposite port; the value dies at this hop.
                    return Ok(None);
                }
                vec![opposite]
            }
            ForwardingPolicy::OneToFan => self.ports_of(landing.kind.invert_edge()),
            ForwardingPolicy::OneToAllIn => self.ports_of(SourceKind::InputEdge),
            ForwardingPolicy::OneToAllOut => self.ports_of(SourceKind::OutputEdge),
            ForwardingPolicy::OneToAll => {
                let mut all = self.ports_of(SourceKind::InputEdge);
                all.extend(self.ports_of(SourceKind::OutputEdge));
                all
            }
        };

        let landing_key = self.insert_property(id, landing, value.clone())?;
        let mut targets = Vec::new();
        for src in counterparts {
            if src == landing {
                continue;
            }
            let key = match self.find_property(src, id) {
                Some(key) => key,
                None => self.insert_property(id, src, value.clone())?,
            };
            targets.push(key);
        }
        if !targets.is_empty() {
            let outputs = targets.clone();
            self.resolvers.push(Resolver {
                inputs: vec![landing_key],
                outputs: targets,
                func: Box::new(move |ctx| {
                    let value = ctx.value(landing_key)?;
                    for key in &outputs {
                        ctx.set_value(*key, value.clone())?;
                    }
                    Ok(())
                }),
            });
        }
        Ok(Some(landing_key))
    }

    fn ports_of(&self, kind: SourceKind) -> Vec<SourceInfo> {
        let count = match kind {
            SourceKind::InputEdge => self.num_inputs,
            SourceKind::OutputEdge => self.num_outputs,
            _ => 0,
        };
        (0..count).map(|i| SourceInfo::new(kind, i)).collect()
    }

    /// Dispatches an action arriving on `port`. With no handler for the
    /// action's key, the action forwarding policy for that key decides
    /// where the action goes next.
    pub(crate) fn receive_action(
        &self,
        port: SourceInfo,
        action: &Action,
        outbox: &mut ActionOutbox<'_>,
    ) -> Result<(), CoreError> {
        if let Some(handler) = self.action_handlers.get(action.key()).cloned() {
            return (handler.as_ref())(self, port, action, outbox);
        }
        let policy = self.action_forwarding_policy(action.key());
        trace!(
            node = %self.unique_id,
            key = action.key(),
            ?policy,
            "no handler, forwarding action per policy"
        );
        let targets: Vec<SourceInfo> = match policy {
            ForwardingPolicy::Drop => Vec::new(),
            ForwardingPolicy::OneToOne => {
                let opposite = port.inverted();
                if self.port_exists(opposite) {
                    vec![opposite]
                } else {
                    Vec::new()
                }
            }
            ForwardingPolicy::OneToFan => self.ports_of(port.kind.invert_edge()),
            ForwardingPolicy::OneToAllIn => self.ports_of(SourceKind::InputEdge),
            ForwardingPolicy::OneToAllOut => self.ports_of(SourceKind::OutputEdge),
            ForwardingPolicy::OneToAll => {
                let mut all = self.ports_of(SourceKind::InputEdge);
                all.extend(self.ports_of(SourceKind::OutputEdge));
                all
            }
        };
        for target in targets {
            outbox.post(target, action.clone())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("unique_id", &self.unique_id)
            .field("num_inputs", &self.num_inputs)
            .field("num_outputs", &self.num_outputs)
            .field("num_props", &(self.props.len() - 1))
            .field("num_resolvers", &self.resolvers.len())
            .finish()
    }
}

fn lookup_policy(policies: &HashMap<String, ForwardingPolicy>, key: &str) -> ForwardingPolicy {
    policies
        .get(key)
        .or_else(|| policies.get(""))
        .copied()
        .unwrap_or(ForwardingPolicy::OneToOne)
}

/// Runs one resolver under scoped access: outputs get write access
/// (locked write access if already written this pass), everything else
/// is readable, and the previous modes are restored on every exit path.
fn run_resolver(
    resolver: &mut Resolver,
    props: &mut [Property],
    node_id: &str,
    written: &HashSet<usize>,
) -> Result<(), CoreError> {
    let saved: Vec<Access> = props.iter().map(|p| p.access()).collect();
    for prop in props.iter_mut() {
        prop.set_access(Access::ReadOnly);
    }
    for key in &resolver.outputs {
        let mode = if written.contains(&key.0) {
            Access::ReadWriteLocked
        } else {
            Access::ReadWrite
        };
        props[key.0].set_access(mode);
    }
    let mut ctx = PropContext {
        node_id,
        props: &mut *props,
    };
    let result = (resolver.func)(&mut ctx);
    for (prop, access) in props.iter_mut().zip(saved) {
        prop.set_access(access);
    }
    result
}

fn as_resolve_error(node_id: &str, err: CoreError) -> CoreError {
    match err {
        err @ CoreError::Resolve { .. } => err,
        other => CoreError::Resolve {
            reason: format!("resolver on node `{}` failed: {}", node_id, other),
        },
    }
}
