//! Declaration-Site Isolation
//!
//! An [`Operation`] is the declaration record of an asynchronous operation:
//! its name, its isolation annotation and the domain that annotation resolved
//! to. The domain is resolved once, when the operation is declared, and every
//! call runs there no matter which domain the caller is on.

use crate::registry::{ActorId, Domain, DomainRegistry};
use crate::task::{Task, TaskOptions};
use crate::Result;

use std::borrow::Cow;
use std::fmt;
use std::future::Future;

/// Isolation annotation attached to an operation's definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isolation {
    /// Runs on the main domain
    Main,
    /// Runs on one actor instance's executor
    Actor(ActorId),
    /// Must not touch isolated state; runs on the global domain
    NonIsolated,
    /// No annotation; runs on the global domain
    Unspecified,
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Isolation::Main => write!(f, "main"),
            Isolation::Actor(id) => write!(f, "isolated({})", id),
            Isolation::NonIsolated => write!(f, "nonisolated"),
            Isolation::Unspecified => write!(f, "unspecified"),
        }
    }
}

/// Type-level isolation annotation inherited by the type's members
///
/// ```ignore
/// struct Gallery;
///
/// impl IsolatedType for Gallery {
///     fn isolation() -> Isolation {
///         Isolation::Main
///     }
/// }
///
/// let refresh = runtime.declare_member::<Gallery>("refresh")?;
/// assert_eq!(refresh.isolation(), Isolation::Main);
/// ```
pub trait IsolatedType {
    fn isolation() -> Isolation;
}

/// Where an operation's isolation came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationSource {
    /// Annotated on the operation itself
    Explicit,
    /// Inherited from the enclosing type
    Inherited { type_name: &'static str },
}

/// Declaration record of an asynchronous operation
#[derive(Debug, Clone)]
pub struct Operation {
    name: Cow<'static, str>,
    isolation: Isolation,
    source: IsolationSource,
    domain: Domain,
}

impl Operation {
    pub(crate) fn declare(
        registry: &DomainRegistry,
        name: impl Into<Cow<'static, str>>,
        isolation: Isolation,
        source: IsolationSource,
    ) -> Result<Self> {
        let name = name.into();
        let domain = registry.resolve(&isolation)?;

        tracing::debug!(
            operation = %name,
            isolation = %isolation,
            domain = %domain.id(),
            "Declared operation"
        );

        Ok(Self {
            name,
            isolation,
            source,
            domain,
        })
    }

    pub(crate) fn explicit(
        registry: &DomainRegistry,
        name: impl Into<Cow<'static, str>>,
        isolation: Isolation,
    ) -> Result<Self> {
        Self::declare(registry, name, isolation, IsolationSource::Explicit)
    }

    pub(crate) fn member_of<O: IsolatedType + ?Sized>(
        registry: &DomainRegistry,
        name: impl Into<Cow<'static, str>>,
    ) -> Result<Self> {
        Self::declare(
            registry,
            name,
            O::isolation(),
            IsolationSource::Inherited {
                type_name: std::any::type_name::<O>(),
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn source(&self) -> &IsolationSource {
        &self.source
    }

    /// Domain every call of this operation runs on
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    fn options(&self) -> TaskOptions {
        TaskOptions::structured().label(self.name.clone())
    }

    /// Start a call as a structured child of the calling task
    pub fn spawn<T, F>(&self, future: F) -> Task<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.domain.spawn_with(self.options(), future)
    }

    /// Start a call with no relationship to the calling task
    pub fn spawn_detached<T, F>(&self, future: F) -> Task<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.domain
            .spawn_with(TaskOptions::detached().label(self.name.clone()), future)
    }

    /// Run a synchronous body as one continuation on the operation's domain
    pub fn run<T, F>(&self, body: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.spawn(async move { Ok(body()) })
    }

    /// Spawn and await the result
    pub async fn call<T, F>(&self, future: F) -> Result<T>
    where
        T: Clone + Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.spawn(future).await
    }
}
