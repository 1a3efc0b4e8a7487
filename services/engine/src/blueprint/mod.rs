//! Blueprints: typed units of infrastructure with a lifecycle.
//!
//! A blueprint type implements [`Blueprint`]: a DAY0 `create` from a typed
//! request and a `destroy` that by default tears down every resource still
//! in the registry. DAY2 routes and named operations are attached when the
//! type is registered (see [`types::BlueprintType::builder`]).
//!
//! The blueprint value itself is its type-specific state: it is serialized
//! into the persisted document after every operation and deserialized when
//! a worker is rebuilt from the store.

use std::any::Any;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::provider::ProviderError;
use crate::state::StoreError;

pub mod context;
pub mod instance;
pub mod registry;
pub mod types;

pub use context::{BlueprintContext, ChildBlueprints, NoChildren};
pub use instance::{BlueprintInstance, OperationRecord};
pub use registry::{RegistryError, ResourceRegistry};
pub use types::{BlueprintType, BlueprintTypeBuilder, BlueprintTypeRegistry, Operation, OperationFuture};

/// Errors raised by blueprint code.
#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("child blueprint {id}: {detail}")]
    Child { id: String, detail: String },

    #[error("reconciliation failed: {0}")]
    Reconcile(String),

    #[error("{0}")]
    Failed(String),
}

/// A blueprint type.
#[async_trait]
pub trait Blueprint: Serialize + DeserializeOwned + Default + Send + 'static {
    /// DAY0 request.
    type Create: DeserializeOwned + Send;

    async fn create(
        &mut self,
        ctx: &mut BlueprintContext,
        request: Self::Create,
    ) -> Result<(), BlueprintError>;

    async fn destroy(&mut self, ctx: &mut BlueprintContext) -> Result<(), BlueprintError> {
        ctx.destroy_all().await
    }
}

/// Object-safe view of a [`Blueprint`], used by workers.
#[async_trait]
pub trait DynBlueprint: Send {
    async fn deploy(&mut self, ctx: &mut BlueprintContext, payload: Value)
        -> Result<(), BlueprintError>;

    async fn teardown(&mut self, ctx: &mut BlueprintContext) -> Result<(), BlueprintError>;

    fn snapshot(&self) -> Result<Value, serde_json::Error>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[async_trait]
impl<B: Blueprint> DynBlueprint for B {
    async fn deploy(
        &mut self,
        ctx: &mut BlueprintContext,
        payload: Value,
    ) -> Result<(), BlueprintError> {
        let request: B::Create = serde_json::from_value(payload)?;
        Blueprint::create(self, ctx, request).await
    }

    async fn teardown(&mut self, ctx: &mut BlueprintContext) -> Result<(), BlueprintError> {
        Blueprint::destroy(self, ctx).await
    }

    fn snapshot(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&*self)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
