//! Processor capabilities and the registry mapping identities to processors.
//!
//! A processor implements any subset of the seven operations. Each operation
//! is a separate trait so that the dispatcher can tell "not registered" apart
//! from "registered but incapable". The [`Processor`] trait exposes each
//! capability as an optional view of `self`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tidewire_core::{Identity, Operation};

use super::context::Context;

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RetrieveManyProcessor: Send + Sync {
    async fn process_retrieve_many(&self, ctx: &mut Context) -> anyhow::Result<()>;
}

#[async_trait]
pub trait RetrieveProcessor: Send + Sync {
    async fn process_retrieve(&self, ctx: &mut Context) -> anyhow::Result<()>;
}

#[async_trait]
pub trait CreateProcessor: Send + Sync {
    async fn process_create(&self, ctx: &mut Context) -> anyhow::Result<()>;
}

#[async_trait]
pub trait UpdateProcessor: Send + Sync {
    async fn process_update(&self, ctx: &mut Context) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DeleteProcessor: Send + Sync {
    async fn process_delete(&self, ctx: &mut Context) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PatchProcessor: Send + Sync {
    async fn process_patch(&self, ctx: &mut Context) -> anyhow::Result<()>;
}

#[async_trait]
pub trait InfoProcessor: Send + Sync {
    async fn process_info(&self, ctx: &mut Context) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Handler registered for one identity.
///
/// Override the `as_*` accessor of every capability the processor
/// implements; the rest default to `None` and yield 501 when requested.
pub trait Processor: Send + Sync {
    fn as_retrieve_many(&self) -> Option<&dyn RetrieveManyProcessor> {
        None
    }

    fn as_retrieve(&self) -> Option<&dyn RetrieveProcessor> {
        None
    }

    fn as_create(&self) -> Option<&dyn CreateProcessor> {
        None
    }

    fn as_update(&self) -> Option<&dyn UpdateProcessor> {
        None
    }

    fn as_delete(&self) -> Option<&dyn DeleteProcessor> {
        None
    }

    fn as_patch(&self) -> Option<&dyn PatchProcessor> {
        None
    }

    fn as_info(&self) -> Option<&dyn InfoProcessor> {
        None
    }
}

impl dyn Processor {
    /// Whether this processor implements `operation`.
    #[must_use]
    pub fn supports(&self, operation: Operation) -> bool {
        match operation {
            Operation::RetrieveMany => self.as_retrieve_many().is_some(),
            Operation::Retrieve => self.as_retrieve().is_some(),
            Operation::Create => self.as_create().is_some(),
            Operation::Update => self.as_update().is_some(),
            Operation::Delete => self.as_delete().is_some(),
            Operation::Patch => self.as_patch().is_some(),
            Operation::Info => self.as_info().is_some(),
        }
    }

    /// Runs `operation` against this processor.
    ///
    /// Returns `None` when the capability is missing.
    pub async fn process(
        &self,
        operation: Operation,
        ctx: &mut Context,
    ) -> Option<anyhow::Result<()>> {
        let result = match operation {
            Operation::RetrieveMany => self.as_retrieve_many()?.process_retrieve_many(ctx).await,
            Operation::Retrieve => self.as_retrieve()?.process_retrieve(ctx).await,
            Operation::Create => self.as_create()?.process_create(ctx).await,
            Operation::Update => self.as_update()?.process_update(ctx).await,
            Operation::Delete => self.as_delete()?.process_delete(ctx).await,
            Operation::Patch => self.as_patch()?.process_patch(ctx).await,
            Operation::Info => self.as_info()?.process_info(ctx).await,
        };
        Some(result)
    }
}

// ---------------------------------------------------------------------------
// ProcessorRegistry
// ---------------------------------------------------------------------------

/// Errors raised while (un)registering processors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a processor is already registered for identity '{0}'")]
    Duplicate(String),
    #[error("no processor registered for identity '{0}'")]
    NotRegistered(String),
}

/// Maps identity names to their processor.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: DashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `processor` for `identity`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Duplicate` if the identity already has one.
    pub fn register(
        &self,
        identity: &Identity,
        processor: Arc<dyn Processor>,
    ) -> Result<(), RegistryError> {
        match self.processors.entry(identity.name.clone()) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(identity.name.clone())),
            Entry::Vacant(slot) => {
                slot.insert(processor);
                tracing::debug!(identity = %identity, "processor registered");
                Ok(())
            }
        }
    }

    /// Removes the processor of `identity`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotRegistered` if there is none.
    pub fn unregister(&self, identity: &Identity) -> Result<(), RegistryError> {
        self.processors
            .remove(&identity.name)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotRegistered(identity.name.clone()))
    }

    #[must_use]
    pub fn processor(&self, identity: &Identity) -> Option<Arc<dyn Processor>> {
        self.processors
            .get(&identity.name)
            .map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tidewire_core::Identity;

    use super::*;
    use crate::service::context::Request;

    #[derive(Default)]
    struct CreateOnly {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CreateProcessor for CreateOnly {
        async fn process_create(&self, ctx: &mut Context) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.set_status_code(202);
            Ok(())
        }
    }

    impl Processor for CreateOnly {
        fn as_create(&self) -> Option<&dyn CreateProcessor> {
            Some(self)
        }
    }

    fn list() -> Identity {
        Identity::new("list", "lists")
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ProcessorRegistry::new();
        registry
            .register(&list(), Arc::new(CreateOnly::default()))
            .unwrap();
        assert_eq!(
            registry.register(&list(), Arc::new(CreateOnly::default())),
            Err(RegistryError::Duplicate("list".to_string()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_removes_processor() {
        let registry = ProcessorRegistry::new();
        registry
            .register(&list(), Arc::new(CreateOnly::default()))
            .unwrap();
        registry.unregister(&list()).unwrap();
        assert!(registry.processor(&list()).is_none());
        assert_eq!(
            registry.unregister(&list()),
            Err(RegistryError::NotRegistered("list".to_string()))
        );
    }

    #[test]
    fn supports_reflects_capabilities() {
        let processor: Arc<dyn Processor> = Arc::new(CreateOnly::default());
        assert!(processor.supports(Operation::Create));
        for op in Operation::ALL {
            if op != Operation::Create {
                assert!(!processor.supports(op), "{op} should not be supported");
            }
        }
    }

    #[tokio::test]
    async fn process_routes_to_capability() {
        let spy = Arc::new(CreateOnly::default());
        let processor: Arc<dyn Processor> = spy.clone();
        let mut ctx = Context::new(Request::new(Operation::Create, list()));

        let result = processor.process(Operation::Create, &mut ctx).await;
        assert!(matches!(result, Some(Ok(()))));
        assert_eq!(ctx.status_code(), Some(202));

        assert!(processor.process(Operation::Delete, &mut ctx).await.is_none());
        assert_eq!(spy.calls.load(Ordering::SeqCst), 1);
    }
}
