//! Managed objects: dependency providers with a lifecycle.
//!
//! A [`ManagedObjectSource`] is initialised once when the office is built and
//! sources [`ManagedObject`]s on demand, either synchronously or by keeping the
//! [`ManagedObjectUser`] and notifying it later. Capabilities are declared in
//! the source's [`SourceMetadata`] and computed once at registration.

pub(crate) mod container;
pub mod pool;
pub mod recycle;
pub mod user;

pub use pool::{IdlePool, ManagedObjectPool};
pub use recycle::{CleanupEscalation, RecycleContext, RecycleFn};
pub use user::{
    AsyncOperation, AsynchronousContext, ExecuteContext, ManagedObjectContext, ManagedObjectUser,
};

use indexmap::IndexMap;
use kiln_core::Escalation;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Object handed to functions
pub type ObjectValue = Arc<dyn Any + Send + Sync>;

/// Lifetime of a managed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagedObjectScope {
    /// Sourced and recycled per function
    Function,
    /// Shared by the functions of one thread
    Thread,
    /// Shared process-wide
    Process,
}

/// Optional managed object behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Receives a [`ManagedObjectContext`]
    ContextAware,
    /// Receives an [`AsynchronousContext`]
    Asynchronous,
    /// Loads declared dependencies before use
    Coordinating,
}

impl Capability {
    const fn bit(self) -> u8 {
        match self {
            Self::ContextAware => 1,
            Self::Asynchronous => 1 << 1,
            Self::Coordinating => 1 << 2,
        }
    }
}

/// Capability bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    /// No capabilities
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Add a capability
    #[must_use]
    pub const fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    /// Check a capability
    #[must_use]
    pub const fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

/// What a source declares about the objects it provides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMetadata {
    /// Capabilities of every sourced object
    pub capabilities: Capabilities,
    /// Dependency keys, loaded by coordinating objects
    pub dependencies: Vec<String>,
    /// Flow keys the source may invoke through its [`ExecuteContext`]
    pub flows: Vec<String>,
}

impl SourceMetadata {
    /// Empty metadata
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a capability
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities = self.capabilities.with(capability);
        self
    }

    /// Declare a dependency key; implies [`Capability::Coordinating`]
    #[must_use]
    pub fn with_dependency(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(key.into());
        self.with_capability(Capability::Coordinating)
    }

    /// Declare a flow key
    #[must_use]
    pub fn with_flow(mut self, key: impl Into<String>) -> Self {
        self.flows.push(key.into());
        self
    }
}

/// Context for [`ManagedObjectSource::init`]
#[derive(Debug)]
pub struct SourceContext<'a> {
    name: &'a str,
    properties: &'a IndexMap<String, String>,
}

impl<'a> SourceContext<'a> {
    pub(crate) fn new(name: &'a str, properties: &'a IndexMap<String, String>) -> Self {
        Self { name, properties }
    }

    /// Registered managed object name
    #[must_use]
    pub fn name(&self) -> &str {
        self.name
    }

    /// Configured property
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Configured property or a default
    #[must_use]
    pub fn property_or<'b>(&'b self, key: &str, default: &'b str) -> &'b str {
        self.property(key).unwrap_or(default)
    }
}

/// Dependencies handed to a coordinating object, keyed by dependency key
pub struct ObjectRegistry {
    entries: Vec<(String, ObjectValue)>,
}

impl ObjectRegistry {
    pub(crate) fn new(entries: Vec<(String, ObjectValue)>) -> Self {
        Self { entries }
    }

    /// Dependency by key
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .and_then(|(_, value)| value.downcast_ref::<T>())
    }

    /// Dependency by key, untyped
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&ObjectValue> {
        self.entries.iter().find(|(name, _)| name == key).map(|(_, value)| value)
    }

    /// Number of dependencies
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A sourced object and its capability hooks.
///
/// Hooks are called only when the source declared the matching capability.
pub trait ManagedObject: Send + Sync + 'static {
    /// Object handed to functions
    fn object(&self) -> ObjectValue;

    /// Context for [`Capability::ContextAware`] objects
    fn set_context(&self, _context: ManagedObjectContext) {}

    /// Context for [`Capability::Asynchronous`] objects
    fn set_asynchronous_context(&self, _context: AsynchronousContext) {}

    /// Load dependencies for [`Capability::Coordinating`] objects
    ///
    /// # Errors
    ///
    /// Fails the object; every function waiting on it escalates
    fn load_objects(&self, _registry: &ObjectRegistry) -> Result<(), Escalation> {
        Ok(())
    }
}

/// Provider of managed objects
pub trait ManagedObjectSource: Send + Sync + 'static {
    /// Initialise and declare metadata
    ///
    /// # Errors
    ///
    /// Fails building the office
    fn init(&self, _context: &SourceContext<'_>) -> Result<SourceMetadata, Escalation> {
        Ok(SourceMetadata::default())
    }

    /// Start once the office is built
    ///
    /// # Errors
    ///
    /// Fails building the office
    fn start(&self, _context: ExecuteContext) -> Result<(), Escalation> {
        Ok(())
    }

    /// Source an object, now or later, through `user`
    fn source(&self, user: ManagedObjectUser);

    /// Office is closing
    fn stop(&self) {}
}

/// Managed object wrapping a plain value
pub struct ValueObject(ObjectValue);

impl ValueObject {
    /// Wrap a value
    #[must_use]
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }
}

impl ManagedObject for ValueObject {
    fn object(&self) -> ObjectValue {
        Arc::clone(&self.0)
    }
}

/// Source that builds values synchronously from a closure
pub struct FnSource<F> {
    factory: F,
}

impl<F, T> FnSource<F>
where
    F: Fn() -> Result<T, Escalation> + Send + Sync + 'static,
    T: Any + Send + Sync,
{
    /// Create a source around `factory`
    #[must_use]
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F, T> ManagedObjectSource for FnSource<F>
where
    F: Fn() -> Result<T, Escalation> + Send + Sync + 'static,
    T: Any + Send + Sync,
{
    fn source(&self, user: ManagedObjectUser) {
        match (self.factory)() {
            Ok(value) => {
                user.set_managed_object(Arc::new(ValueObject::new(value)));
            }
            Err(escalation) => {
                user.set_failure(escalation);
            }
        }
    }
}

/// Managed object registration
pub struct ManagedObjectSpec {
    pub(crate) name: String,
    pub(crate) source: Arc<dyn ManagedObjectSource>,
    pub(crate) scope: ManagedObjectScope,
    pub(crate) dependencies: Vec<(String, String)>,
    pub(crate) flows: Vec<(String, String)>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) pool: Option<Arc<dyn ManagedObjectPool>>,
    pub(crate) recycle: Option<RecycleFn>,
    pub(crate) properties: IndexMap<String, String>,
}

impl ManagedObjectSpec {
    /// Register `source` under `name`
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        scope: ManagedObjectScope,
        source: impl ManagedObjectSource,
    ) -> Self {
        Self {
            name: name.into(),
            source: Arc::new(source),
            scope,
            dependencies: Vec::new(),
            flows: Vec::new(),
            timeout: None,
            pool: None,
            recycle: None,
            properties: IndexMap::new(),
        }
    }

    /// Register a synchronous closure source
    #[must_use]
    pub fn from_fn<F, T>(name: impl Into<String>, scope: ManagedObjectScope, factory: F) -> Self
    where
        F: Fn() -> Result<T, Escalation> + Send + Sync + 'static,
        T: Any + Send + Sync,
    {
        Self::new(name, scope, FnSource::new(factory))
    }

    /// Link a dependency key to another managed object
    #[must_use]
    pub fn with_dependency(mut self, key: impl Into<String>, object: impl Into<String>) -> Self {
        self.dependencies.push((key.into(), object.into()));
        self
    }

    /// Link a flow key to a function
    #[must_use]
    pub fn with_flow(mut self, key: impl Into<String>, function: impl Into<String>) -> Self {
        self.flows.push((key.into(), function.into()));
        self
    }

    /// Override the sourcing and asynchronous operation timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Source through a pool
    #[must_use]
    pub fn with_pool(mut self, pool: impl ManagedObjectPool) -> Self {
        self.pool = Some(Arc::new(pool));
        self
    }

    /// Recycle function run on scope exit
    #[must_use]
    pub fn with_recycle<F>(mut self, recycle: F) -> Self
    where
        F: Fn(&mut RecycleContext<'_>) -> Result<(), Escalation> + Send + Sync + 'static,
    {
        self.recycle = Some(Arc::new(recycle));
        self
    }

    /// Property available to the source's `init`
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Registered name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ManagedObjectSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedObjectSpec")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("dependencies", &self.dependencies)
            .field("flows", &self.flows)
            .field("timeout", &self.timeout)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}
