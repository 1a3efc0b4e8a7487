//! Blueprint manager.
//!
//! Maps blueprint ids to running workers. A worker is created for every new
//! blueprint and, for existing ones, lazily rebuilt from the store on first
//! access. Requests are validated against the type registry here, before
//! anything is enqueued: an unknown type, route or operation name, or a
//! payload that does not fit the handler's request type, is an error for
//! the caller and never reaches a worker.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use lcm_events::OperationOutcome;
use lcm_id::BlueprintId;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::worker::{
    spawn_worker, CallError, Reply, WorkerEnv, WorkerHandle, WorkerMessage, WorkerMessageType,
};
use crate::blueprint::{
    BlueprintError, BlueprintInstance, BlueprintType, BlueprintTypeRegistry, ChildBlueprints,
    Operation,
};
use crate::events::EventPublisher;
use crate::provider::ProviderRegistry;
use crate::state::{BlueprintStore, StoreError};

/// Errors returned to manager callers.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("blueprint {0} not found")]
    NotFound(BlueprintId),

    #[error("blueprint {0} already exists")]
    AlreadyExists(BlueprintId),

    #[error("unknown blueprint type '{0}'")]
    UnknownType(String),

    #[error("blueprint type '{blueprint_type}' has no route '{path}'")]
    UnknownRoute { blueprint_type: String, path: String },

    #[error("blueprint type '{blueprint_type}' has no operation '{name}'")]
    UnknownOperation { blueprint_type: String, name: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("blueprint {0} is protected")]
    Protected(BlueprintId),

    #[error("blueprint {0} is being deleted")]
    Stopping(BlueprintId),

    #[error("worker for blueprint {0} has stopped")]
    WorkerStopped(BlueprintId),

    #[error("blueprint {id} did not answer within {after:?}")]
    Timeout { id: BlueprintId, after: Duration },

    #[error("operation '{operation}' on blueprint {id} failed: {detail}")]
    OperationFailed {
        id: BlueprintId,
        operation: String,
        detail: String,
    },

    #[error("cannot restore blueprint {id}: {detail}")]
    Load { id: BlueprintId, detail: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ManagerError {
    fn from_call(id: BlueprintId, error: CallError) -> Self {
        match error {
            CallError::Stopped => Self::WorkerStopped(id),
            CallError::Timeout(after) => Self::Timeout { id, after },
        }
    }
}

struct ManagerInner {
    workers: Mutex<HashMap<BlueprintId, WorkerHandle>>,
    types: Arc<BlueprintTypeRegistry>,
    env: WorkerEnv,
    sync_timeout: Duration,
}

/// Process-wide entry point for blueprint operations.
#[derive(Clone)]
pub struct BlueprintManager {
    inner: Arc<ManagerInner>,
}

impl BlueprintManager {
    /// `sync_timeout` bounds the `*_sync` helpers when the caller passes
    /// no timeout of its own.
    pub fn new(
        store: Arc<dyn BlueprintStore>,
        types: Arc<BlueprintTypeRegistry>,
        providers: Arc<ProviderRegistry>,
        events: Arc<dyn EventPublisher>,
        sync_timeout: Duration,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| ManagerInner {
            workers: Mutex::new(HashMap::new()),
            types,
            env: WorkerEnv {
                store,
                providers,
                children: Arc::new(ManagerChildren {
                    inner: weak.clone(),
                }),
                events,
            },
            sync_timeout,
        });
        Self { inner }
    }

    fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub fn store(&self) -> &Arc<dyn BlueprintStore> {
        &self.inner.env.store
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.inner.env.providers
    }

    pub fn types(&self) -> &Arc<BlueprintTypeRegistry> {
        &self.inner.types
    }

    fn blueprint_type(&self, name: &str) -> Result<Arc<BlueprintType>, ManagerError> {
        self.inner
            .types
            .get(name)
            .ok_or_else(|| ManagerError::UnknownType(name.to_string()))
    }

    /// The worker for `id`, rebuilt from the store if it is not running.
    ///
    /// A worker stays mapped until its loop exits, so a blueprint whose
    /// STOP is still in flight is never restored a second time.
    pub async fn get_worker(&self, id: &BlueprintId) -> Result<WorkerHandle, ManagerError> {
        let mut workers = self.inner.workers.lock().await;
        if let Some(worker) = workers.get(id) {
            if worker.is_running() {
                if worker.is_stopping() {
                    return Err(ManagerError::Stopping(*id));
                }
                return Ok(worker.clone());
            }
            workers.remove(id);
        }

        let instance = self
            .inner
            .env
            .store
            .load(id)
            .await?
            .ok_or(ManagerError::NotFound(*id))?;
        let ty = self.blueprint_type(&instance.blueprint_type)?;
        let blueprint = ty
            .load_blueprint(instance.state.clone())
            .map_err(|e| ManagerError::Load {
                id: *id,
                detail: e.to_string(),
            })?;

        let worker = spawn_worker(blueprint, instance, &self.inner.env);
        info!(blueprint_id = %id, blueprint_type = %ty.name(), "Worker restored from store");
        workers.insert(*id, worker.clone());
        Ok(worker)
    }

    async fn start_new(&self, ty: &BlueprintType) -> Result<WorkerHandle, ManagerError> {
        let id = BlueprintId::new();
        if self.inner.env.store.load(&id).await?.is_some() {
            return Err(ManagerError::AlreadyExists(id));
        }

        let instance = BlueprintInstance::new(id, ty.name());
        let worker = spawn_worker(ty.fresh_blueprint(), instance, &self.inner.env);
        self.inner.workers.lock().await.insert(id, worker.clone());
        info!(blueprint_id = %id, blueprint_type = %ty.name(), "Blueprint created");
        Ok(worker)
    }

    fn day0_message(ty: &BlueprintType, payload: Value, reply: Option<Reply>) -> WorkerMessage {
        WorkerMessage::Day0 {
            path: format!("/{}", ty.name()),
            payload,
            reply,
        }
    }

    /// Create a blueprint and enqueue its DAY0. Returns before provisioning
    /// starts.
    pub async fn create_blueprint(
        &self,
        blueprint_type: &str,
        payload: Value,
    ) -> Result<BlueprintId, ManagerError> {
        let ty = self.blueprint_type(blueprint_type)?;
        ty.validate_create(&payload)
            .map_err(|e| ManagerError::InvalidPayload(e.to_string()))?;

        let worker = self.start_new(&ty).await?;
        worker
            .put(Self::day0_message(&ty, payload, None))
            .map_err(|_| ManagerError::WorkerStopped(worker.id()))?;
        Ok(worker.id())
    }

    /// Create a blueprint and wait for its DAY0 to finish.
    pub async fn create_blueprint_sync(
        &self,
        blueprint_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<(BlueprintId, OperationOutcome), ManagerError> {
        let ty = self.blueprint_type(blueprint_type)?;
        ty.validate_create(&payload)
            .map_err(|e| ManagerError::InvalidPayload(e.to_string()))?;

        let worker = self.start_new(&ty).await?;
        let id = worker.id();
        let outcome = worker
            .call(
                |reply| Self::day0_message(&ty, payload, Some(reply)),
                timeout.unwrap_or(self.inner.sync_timeout),
            )
            .await
            .map_err(|e| ManagerError::from_call(id, e))?;
        Ok((id, outcome))
    }

    /// Look up and validate the operation a DAY2 message would run.
    fn resolve(
        &self,
        worker: &WorkerHandle,
        kind: WorkerMessageType,
        key: &str,
        payload: &Value,
    ) -> Result<Operation, ManagerError> {
        let ty = self.blueprint_type(worker.blueprint_type())?;
        let operation = match kind {
            WorkerMessageType::Day2 => {
                ty.route(key)
                    .cloned()
                    .ok_or_else(|| ManagerError::UnknownRoute {
                        blueprint_type: ty.name().to_string(),
                        path: key.to_string(),
                    })?
            }
            _ => ty
                .operation(key)
                .cloned()
                .ok_or_else(|| ManagerError::UnknownOperation {
                    blueprint_type: ty.name().to_string(),
                    name: key.to_string(),
                })?,
        };
        operation
            .validate(payload)
            .map_err(|e| ManagerError::InvalidPayload(e.to_string()))?;
        Ok(operation)
    }

    /// Enqueue a DAY2 request on `path`.
    pub async fn day2(
        &self,
        id: &BlueprintId,
        path: &str,
        payload: Value,
    ) -> Result<(), ManagerError> {
        let worker = self.get_worker(id).await?;
        let operation = self.resolve(&worker, WorkerMessageType::Day2, path, &payload)?;
        worker
            .put(WorkerMessage::Day2 {
                path: path.to_string(),
                operation,
                payload,
                reply: None,
            })
            .map_err(|_| ManagerError::WorkerStopped(*id))
    }

    /// Run a DAY2 request on `path` and wait for its outcome.
    pub async fn day2_sync(
        &self,
        id: &BlueprintId,
        path: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<OperationOutcome, ManagerError> {
        let worker = self.get_worker(id).await?;
        let operation = self.resolve(&worker, WorkerMessageType::Day2, path, &payload)?;
        worker
            .call(
                |reply| WorkerMessage::Day2 {
                    path: path.to_string(),
                    operation,
                    payload,
                    reply: Some(reply),
                },
                timeout.unwrap_or(self.inner.sync_timeout),
            )
            .await
            .map_err(|e| ManagerError::from_call(*id, e))
    }

    /// Run the named operation `name` and wait for its outcome.
    pub async fn call_by_name(
        &self,
        id: &BlueprintId,
        name: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<OperationOutcome, ManagerError> {
        let worker = self.get_worker(id).await?;
        let operation = self.resolve(&worker, WorkerMessageType::Day2ByName, name, &args)?;
        worker
            .call(
                |reply| WorkerMessage::Day2ByName {
                    name: name.to_string(),
                    operation,
                    args,
                    reply: Some(reply),
                },
                timeout.unwrap_or(self.inner.sync_timeout),
            )
            .await
            .map_err(|e| ManagerError::from_call(*id, e))
    }

    async fn ensure_unprotected(&self, id: &BlueprintId) -> Result<(), ManagerError> {
        match self.inner.env.store.load(id).await? {
            Some(instance) if instance.protected => Err(ManagerError::Protected(*id)),
            _ => Ok(()),
        }
    }

    /// Claim the teardown of `id`. Fails if it is protected or another
    /// caller already queued its STOP.
    async fn claim_stop(&self, id: &BlueprintId) -> Result<WorkerHandle, ManagerError> {
        let worker = self.get_worker(id).await?;
        self.ensure_unprotected(id).await?;
        if !worker.begin_stop() {
            return Err(ManagerError::Stopping(*id));
        }
        Ok(worker)
    }

    /// Enqueue STOP. The worker is forgotten once its loop exits.
    pub async fn delete_blueprint(&self, id: &BlueprintId) -> Result<(), ManagerError> {
        let worker = self.claim_stop(id).await?;
        worker
            .put(WorkerMessage::Stop { reply: None })
            .map_err(|_| ManagerError::WorkerStopped(*id))?;
        info!(blueprint_id = %id, "Blueprint deletion enqueued");
        Ok(())
    }

    /// Enqueue STOP and wait for the teardown.
    pub async fn delete_blueprint_sync(
        &self,
        id: &BlueprintId,
        timeout: Option<Duration>,
    ) -> Result<OperationOutcome, ManagerError> {
        let worker = self.claim_stop(id).await?;
        worker
            .call(
                |reply| WorkerMessage::Stop { reply: Some(reply) },
                timeout.unwrap_or(self.inner.sync_timeout),
            )
            .await
            .map_err(|e| ManagerError::from_call(*id, e))
    }

    /// Wait until the worker of `id` has exited, if one is mapped.
    pub async fn wait_stopped(
        &self,
        id: &BlueprintId,
        timeout: Option<Duration>,
    ) -> Result<(), ManagerError> {
        let worker = self.inner.workers.lock().await.get(id).cloned();
        let Some(worker) = worker else {
            return Ok(());
        };
        let after = timeout.unwrap_or(self.inner.sync_timeout);
        tokio::time::timeout(after, worker.stopped())
            .await
            .map_err(|_| ManagerError::Timeout { id: *id, after })
    }

    /// Ids of the workers that are running and not being torn down.
    /// Exited workers are dropped from the map on the way.
    async fn live_ids(&self) -> Vec<BlueprintId> {
        let mut workers = self.inner.workers.lock().await;
        workers.retain(|_, worker| worker.is_running());
        workers
            .iter()
            .filter(|(_, worker)| !worker.is_stopping())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Enqueue STOP for every live worker. Protected blueprints are
    /// skipped. Returns the ids that were enqueued.
    pub async fn delete_all_blueprints(&self) -> Vec<BlueprintId> {
        let ids = self.live_ids().await;
        let mut deleted = Vec::with_capacity(ids.len());
        for id in ids {
            match self.delete_blueprint(&id).await {
                Ok(()) => deleted.push(id),
                Err(e) => warn!(blueprint_id = %id, error = %e, "Skipping blueprint"),
            }
        }
        deleted
    }

    /// Raise the cancellation flag of the operation `id` is running.
    ///
    /// Only waits on the backend, the management port and remote
    /// configuration runs observe the flag.
    pub async fn cancel_in_flight(&self, id: &BlueprintId) -> Result<(), ManagerError> {
        let workers = self.inner.workers.lock().await;
        let worker = workers.get(id).ok_or(ManagerError::NotFound(*id))?;
        worker.cancel_in_flight();
        info!(blueprint_id = %id, "Cancellation requested");
        Ok(())
    }

    /// Summary of the persisted document.
    pub async fn summary(&self, id: &BlueprintId, detailed: bool) -> Result<Value, ManagerError> {
        let instance = self
            .inner
            .env
            .store
            .load(id)
            .await?
            .ok_or(ManagerError::NotFound(*id))?;
        Ok(instance.summary(detailed))
    }

    /// Summaries of every persisted blueprint, oldest first.
    pub async fn list(
        &self,
        blueprint_type: Option<&str>,
        detailed: bool,
    ) -> Result<Vec<Value>, ManagerError> {
        let instances = self.inner.env.store.list(blueprint_type).await?;
        Ok(instances.iter().map(|i| i.summary(detailed)).collect())
    }

    /// Set or clear the protected flag through the worker.
    pub async fn protect(&self, id: &BlueprintId, protected: bool) -> Result<bool, ManagerError> {
        let outcome = self
            .call_by_name(id, "protect", json!(protected), None)
            .await?;
        if !outcome.is_ok() {
            return Err(ManagerError::OperationFailed {
                id: *id,
                operation: "protect".to_string(),
                detail: outcome.detail.unwrap_or_default(),
            });
        }
        Ok(outcome
            .result
            .and_then(|v| v.as_bool())
            .unwrap_or(protected))
    }

    /// Number of workers that are running and not being torn down.
    pub async fn worker_count(&self) -> usize {
        self.live_ids().await.len()
    }
}

/// Lets blueprints deploy and drive other blueprints.
///
/// Holds the manager weakly: workers own their context, and the context
/// must not keep the manager alive.
struct ManagerChildren {
    inner: Weak<ManagerInner>,
}

impl ManagerChildren {
    fn manager(&self) -> Result<BlueprintManager, BlueprintError> {
        self.inner
            .upgrade()
            .map(BlueprintManager::from_inner)
            .ok_or_else(|| BlueprintError::Failed("blueprint manager is gone".to_string()))
    }
}

fn child_error(id: &BlueprintId, detail: impl ToString) -> BlueprintError {
    BlueprintError::Child {
        id: id.to_string(),
        detail: detail.to_string(),
    }
}

#[async_trait]
impl ChildBlueprints for ManagerChildren {
    async fn deploy(
        &self,
        blueprint_type: &str,
        payload: Value,
    ) -> Result<BlueprintId, BlueprintError> {
        let manager = self.manager()?;
        let (id, outcome) = manager
            .create_blueprint_sync(blueprint_type, payload, None)
            .await
            .map_err(|e| BlueprintError::Failed(format!("deploying {blueprint_type}: {e}")))?;
        if outcome.is_ok() {
            debug!(child = %id, blueprint_type, "Child blueprint deployed");
            return Ok(id);
        }

        let detail = outcome.detail.unwrap_or_default();
        warn!(child = %id, blueprint_type, detail = %detail, "Child DAY0 failed, destroying it");
        if let Err(e) = manager.delete_blueprint_sync(&id, None).await {
            warn!(child = %id, error = %e, "Failed to destroy child");
        }
        Err(child_error(&id, detail))
    }

    async fn call(
        &self,
        id: &BlueprintId,
        operation: &str,
        args: Value,
    ) -> Result<Value, BlueprintError> {
        let outcome = self
            .manager()?
            .call_by_name(id, operation, args, None)
            .await
            .map_err(|e| child_error(id, e))?;
        if !outcome.is_ok() {
            return Err(child_error(id, outcome.detail.unwrap_or_default()));
        }
        Ok(outcome.result.unwrap_or(Value::Null))
    }

    async fn destroy(&self, id: &BlueprintId) -> Result<(), BlueprintError> {
        let manager = self.manager()?;
        match manager.delete_blueprint_sync(id, None).await {
            Ok(outcome) if outcome.is_ok() => Ok(()),
            Ok(outcome) => Err(child_error(id, outcome.detail.unwrap_or_default())),
            Err(ManagerError::NotFound(_)) => {
                warn!(child = %id, "Child already gone");
                Ok(())
            }
            Err(ManagerError::Stopping(_)) => {
                debug!(child = %id, "Child teardown already queued, waiting for it");
                manager
                    .wait_stopped(id, None)
                    .await
                    .map_err(|e| child_error(id, e))?;
                match manager.store().load(id).await {
                    Ok(None) => Ok(()),
                    Ok(Some(_)) => Err(child_error(id, "teardown failed, record kept")),
                    Err(e) => Err(child_error(id, e)),
                }
            }
            Err(e) => Err(child_error(id, e)),
        }
    }
}
