//! Kind → handler registry.
//!
//! Built once at process start and handed to the dispatcher by value; there is
//! no global registration.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::JobContext;
use crate::error::{JobError, RegistryError};
use crate::store::JobStore;
use crate::types::JobArgs;

/// Handles one job kind with decoded arguments.
///
/// Handlers may run more than once for the same arguments (at-least-once
/// delivery) and must tolerate that.
///
/// ```ignore
/// struct SendReceipt;
///
/// #[async_trait]
/// impl<B: JobStore> Handler<B> for SendReceipt {
///     type Args = ReceiptArgs;
///
///     async fn handle(&self, ctx: &mut JobContext<'_, B>, args: ReceiptArgs) -> Result<(), JobError> {
///         ...
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<B: JobStore>: Send + Sync + 'static {
    type Args: JobArgs;

    async fn handle(&self, ctx: &mut JobContext<'_, B>, args: Self::Args) -> Result<(), JobError>;
}

/// Object-safe form of [`Handler`] stored in the registry.
#[async_trait]
pub trait DynHandler<B: JobStore>: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn call(&self, ctx: &mut JobContext<'_, B>) -> Result<(), JobError>;
}

struct TypedHandler<B, H> {
    handler: H,
    _backend: PhantomData<fn() -> B>,
}

#[async_trait]
impl<B: JobStore, H: Handler<B>> DynHandler<B> for TypedHandler<B, H> {
    fn kind(&self) -> &'static str {
        <H::Args as JobArgs>::KIND
    }

    async fn call(&self, ctx: &mut JobContext<'_, B>) -> Result<(), JobError> {
        let args: H::Args = ctx.job().args_as().map_err(|e| {
            JobError::validation(format!("invalid args for '{}': {e}", <H::Args as JobArgs>::KIND))
        })?;
        self.handler.handle(ctx, args).await
    }
}

/// Immutable registry consumed by the dispatcher.
pub struct Registry<B: JobStore> {
    handlers: HashMap<&'static str, Arc<dyn DynHandler<B>>>,
}

impl<B: JobStore> Clone for Registry<B> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<B: JobStore> Registry<B> {
    pub fn builder() -> RegistryBuilder<B> {
        RegistryBuilder::new()
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn DynHandler<B>>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        kinds
    }
}

pub struct RegistryBuilder<B: JobStore> {
    handlers: HashMap<&'static str, Arc<dyn DynHandler<B>>>,
}

impl<B: JobStore> Default for RegistryBuilder<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: JobStore> RegistryBuilder<B> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `H::Args::KIND`. A second handler for the same kind is an error.
    pub fn register<H: Handler<B>>(mut self, handler: H) -> Result<Self, RegistryError> {
        let kind = <H::Args as JobArgs>::KIND;
        if self.handlers.contains_key(kind) {
            return Err(RegistryError::AlreadyRegistered(kind.to_string()));
        }
        self.handlers.insert(
            kind,
            Arc::new(TypedHandler {
                handler,
                _backend: PhantomData,
            }),
        );
        Ok(self)
    }

    pub fn build(self) -> Registry<B> {
        Registry {
            handlers: self.handlers,
        }
    }
}
