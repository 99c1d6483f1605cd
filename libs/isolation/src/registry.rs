//! Domain Registry
//!
//! Maps domain identities (the main domain, actor instances, the global
//! domain) to their executors and resolves declaration-site isolation to a
//! [`Domain`]. Resolution never looks at the caller.

use crate::executor::{current_domain_id, Executor, ExecutorSettings, SerialExecutor};
use crate::isolation::Isolation;
use crate::metrics::RuntimeMetrics;
use crate::{Result, RuntimeError};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use uuid::Uuid;

/// Unique actor identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorId {
    id: Uuid,
}

impl ActorId {
    /// Create new actor ID
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    /// Create from UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self { id }
    }

    /// Get UUID
    pub fn uuid(&self) -> Uuid {
        self.id
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor-{}", self.id.simple())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of an isolation domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainId {
    /// The distinguished main domain, bound to one thread
    Main,
    /// One actor instance
    Actor(ActorId),
    /// Unspecified background work
    Global,
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainId::Main => write!(f, "main"),
            DomainId::Actor(id) => write!(f, "{}", id),
            DomainId::Global => write!(f, "global"),
        }
    }
}

/// A resolved isolation domain: an identity plus the executor serving it
#[derive(Clone)]
pub struct Domain {
    executor: Arc<dyn Executor>,
}

impl Domain {
    pub(crate) fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    pub fn id(&self) -> &DomainId {
        self.executor.domain_id()
    }

    /// Whether the calling code is running on this domain right now
    pub fn is_current(&self) -> bool {
        current_domain_id().as_ref() == Some(self.id())
    }

    /// Error unless the calling code is running on this domain
    pub fn check_current(&self, what: &str) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(RuntimeError::isolation_violation(
                what,
                *self.id(),
                current_domain_id(),
            ))
        }
    }

    pub fn is_serial(&self) -> bool {
        self.executor.is_serial()
    }

    pub fn queue_depth(&self) -> usize {
        self.executor.queue_depth()
    }

    pub(crate) fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub(crate) fn metrics(&self) -> &Arc<RuntimeMetrics> {
        self.executor.metrics()
    }
}

impl PartialEq for Domain {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Domain {}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", self.id())
            .field("serial", &self.is_serial())
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}

/// Registry of every live domain in a runtime
#[derive(Clone)]
pub struct DomainRegistry {
    main: Domain,
    global: Domain,
    actors: Arc<RwLock<HashMap<ActorId, Domain>>>,
    pool: Handle,
    settings: ExecutorSettings,
    metrics: Arc<RuntimeMetrics>,
}

impl DomainRegistry {
    pub(crate) fn new(
        main: Domain,
        global: Domain,
        pool: Handle,
        settings: ExecutorSettings,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            main,
            global,
            actors: Arc::new(RwLock::new(HashMap::new())),
            pool,
            settings,
            metrics,
        }
    }

    pub fn main(&self) -> &Domain {
        &self.main
    }

    pub fn global(&self) -> &Domain {
        &self.global
    }

    /// Resolve a declaration-site isolation to its domain
    pub fn resolve(&self, isolation: &Isolation) -> Result<Domain> {
        match isolation {
            Isolation::Main => Ok(self.main.clone()),
            Isolation::Actor(id) => self.lookup(id),
            Isolation::NonIsolated | Isolation::Unspecified => Ok(self.global.clone()),
        }
    }

    /// Create and register a fresh actor domain
    pub fn register_actor(&self, id: ActorId) -> Result<Domain> {
        let mut actors = self.actors.write();
        if actors.contains_key(&id) {
            return Err(RuntimeError::domain(format!("{} is already registered", id)));
        }

        let executor = SerialExecutor::pooled(
            DomainId::Actor(id),
            self.pool.clone(),
            self.settings,
            Arc::clone(&self.metrics),
        );
        let domain = Domain::new(executor as Arc<dyn Executor>);
        actors.insert(id, domain.clone());

        tracing::debug!(domain = %id, "Registered actor domain");
        Ok(domain)
    }

    /// Unregister actor
    pub fn unregister_actor(&self, id: &ActorId) -> Result<()> {
        match self.actors.write().remove(id) {
            Some(_) => {
                tracing::debug!(domain = %id, "Unregistered actor domain");
                Ok(())
            }
            None => {
                tracing::warn!("Attempted to unregister unknown actor: {}", id);
                Err(RuntimeError::domain(format!("{} not found in registry", id)))
            }
        }
    }

    /// Domain of a registered actor
    pub fn lookup(&self, id: &ActorId) -> Result<Domain> {
        self.actors
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::domain(format!("{} not found in registry", id)))
    }

    pub fn actor_ids(&self) -> Vec<ActorId> {
        self.actors.read().keys().copied().collect()
    }

    pub fn actor_count(&self) -> usize {
        self.actors.read().len()
    }

    /// Shut every executor down and forget all actor domains
    pub(crate) fn shutdown(&self) {
        let actors: Vec<Domain> = self.actors.write().drain().map(|(_, d)| d).collect();
        for domain in &actors {
            domain.executor().shutdown();
        }
        self.global.executor().shutdown();
        self.main.executor().shutdown();
    }
}

impl fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainRegistry")
            .field("actors", &self.actor_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::GlobalExecutor;

    fn registry(rt: &tokio::runtime::Runtime) -> DomainRegistry {
        let metrics = Arc::new(RuntimeMetrics::default());
        let main = SerialExecutor::thread_bound(
            DomainId::Main,
            ExecutorSettings::default(),
            Arc::clone(&metrics),
        );
        let global = GlobalExecutor::new(rt.handle().clone(), Arc::clone(&metrics));
        DomainRegistry::new(
            Domain::new(main as Arc<dyn Executor>),
            Domain::new(global as Arc<dyn Executor>),
            rt.handle().clone(),
            ExecutorSettings::default(),
            metrics,
        )
    }

    #[test]
    fn test_actor_id_display() {
        let id = ActorId::new();
        assert!(id.to_string().starts_with("actor-"));
        assert_eq!(DomainId::Actor(id).to_string(), id.to_string());
        assert_eq!(DomainId::Main.to_string(), "main");
        assert_eq!(DomainId::Global.to_string(), "global");
    }

    #[test]
    fn test_resolution_ignores_caller() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let registry = registry(&rt);

        assert_eq!(registry.resolve(&Isolation::Main).unwrap().id(), &DomainId::Main);
        assert_eq!(
            registry.resolve(&Isolation::Unspecified).unwrap().id(),
            &DomainId::Global
        );
        assert_eq!(
            registry.resolve(&Isolation::NonIsolated).unwrap().id(),
            &DomainId::Global
        );

        let id = ActorId::new();
        let domain = registry.register_actor(id).unwrap();
        assert!(domain.is_serial());
        assert_eq!(registry.resolve(&Isolation::Actor(id)).unwrap(), domain);
    }

    #[test]
    fn test_register_and_unregister() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let registry = registry(&rt);
        let id = ActorId::new();

        registry.register_actor(id).unwrap();
        assert!(registry.register_actor(id).is_err());
        assert_eq!(registry.actor_count(), 1);
        assert_eq!(registry.actor_ids(), vec![id]);

        registry.unregister_actor(&id).unwrap();
        assert_eq!(registry.actor_count(), 0);
        assert!(registry.unregister_actor(&id).is_err());
        assert!(registry.resolve(&Isolation::Actor(id)).is_err());
    }

    #[test]
    fn test_domain_not_current_off_executor() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let registry = registry(&rt);

        assert!(!registry.main().is_current());
        let err = registry.main().check_current("touch main state").unwrap_err();
        assert_eq!(err.category(), "isolation_violation");
    }
}
