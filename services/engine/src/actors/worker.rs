//! Blueprint worker actor.
//!
//! One worker owns one blueprint: its typed value, its instance document
//! and its FIFO mailbox. Messages are handled strictly one at a time; a
//! failing operation is recorded on the instance status and reported to the
//! caller, and the worker moves on to the next message. `STOP` is the only
//! message that ends the worker.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lcm_events::{BlueprintEvent, BlueprintEventType, BlueprintStatus, OperationOutcome, OperationStatus};
use lcm_id::BlueprintId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::framework::{spawn_actor, Actor, ActorContext, ActorError, ActorHandle};
use crate::blueprint::{BlueprintContext, BlueprintInstance, ChildBlueprints, DynBlueprint, Operation};
use crate::cancel::CancelTrigger;
use crate::events::EventPublisher;
use crate::provider::ProviderRegistry;
use crate::state::BlueprintStore;

/// Kind of a worker message, as recorded in the operation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessageType {
    Day0,
    Day2,
    Day2ByName,
    Stop,
}

impl fmt::Display for WorkerMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Day0 => "DAY0",
            Self::Day2 => "DAY2",
            Self::Day2ByName => "DAY2_BY_NAME",
            Self::Stop => "STOP",
        };
        f.write_str(s)
    }
}

/// Resolved exactly once with the outcome of the message it travels with.
pub type Reply = oneshot::Sender<OperationOutcome>;

/// A message for a blueprint worker.
///
/// DAY2 messages carry the operation resolved at enqueue time, so the
/// worker never looks anything up by name.
pub enum WorkerMessage {
    Day0 {
        path: String,
        payload: Value,
        reply: Option<Reply>,
    },
    Day2 {
        path: String,
        operation: Operation,
        payload: Value,
        reply: Option<Reply>,
    },
    Day2ByName {
        name: String,
        operation: Operation,
        args: Value,
        reply: Option<Reply>,
    },
    Stop {
        reply: Option<Reply>,
    },
}

impl WorkerMessage {
    pub fn kind(&self) -> WorkerMessageType {
        match self {
            Self::Day0 { .. } => WorkerMessageType::Day0,
            Self::Day2 { .. } => WorkerMessageType::Day2,
            Self::Day2ByName { .. } => WorkerMessageType::Day2ByName,
            Self::Stop { .. } => WorkerMessageType::Stop,
        }
    }
}

impl fmt::Debug for WorkerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day0 { path, .. } => f.debug_struct("Day0").field("path", path).finish_non_exhaustive(),
            Self::Day2 { path, .. } => f.debug_struct("Day2").field("path", path).finish_non_exhaustive(),
            Self::Day2ByName { name, .. } => {
                f.debug_struct("Day2ByName").field("name", name).finish_non_exhaustive()
            }
            Self::Stop { .. } => f.debug_struct("Stop").finish_non_exhaustive(),
        }
    }
}

/// Everything a worker needs besides its own blueprint.
#[derive(Clone)]
pub struct WorkerEnv {
    pub store: Arc<dyn BlueprintStore>,
    pub providers: Arc<ProviderRegistry>,
    pub children: Arc<dyn ChildBlueprints>,
    pub events: Arc<dyn EventPublisher>,
}

/// The actor behind a [`WorkerHandle`].
pub struct BlueprintWorker {
    blueprint: Box<dyn DynBlueprint>,
    ctx: BlueprintContext,
    events: Arc<dyn EventPublisher>,
    cancel: Arc<CancelTrigger>,
    name: String,
}

impl BlueprintWorker {
    fn id(&self) -> BlueprintId {
        self.ctx.id()
    }

    fn emit(&self, event_type: BlueprintEventType, outcome: Option<&OperationOutcome>) {
        let instance = self.ctx.instance();
        let mut event = BlueprintEvent::new(
            instance.id,
            instance.blueprint_type.clone(),
            event_type,
            instance.status.clone(),
        );
        if let Some(outcome) = outcome {
            event = event.with_outcome(outcome.clone());
        }
        self.events.publish(event);
    }

    /// Persist the instance. A failing store is logged; the worker keeps
    /// serving messages.
    async fn persist(&mut self) {
        if let Err(e) = self.ctx.persist().await {
            error!(blueprint_id = %self.id(), error = %e, "Failed to persist blueprint");
        }
    }

    /// Record the typed blueprint state, close the history entry and
    /// publish the terminal event.
    async fn finish(
        &mut self,
        mut outcome: OperationOutcome,
        ok_event: BlueprintEventType,
        reply: Option<Reply>,
    ) {
        match self.blueprint.snapshot() {
            Ok(state) => self.ctx.instance_mut().state = state,
            Err(e) => {
                if outcome.is_ok() {
                    outcome = OperationOutcome::error(
                        outcome.instance_id,
                        outcome.operation,
                        format!("serializing blueprint state: {e}"),
                    );
                }
            }
        }

        let instance = self.ctx.instance_mut();
        if outcome.is_ok() {
            instance.status = BlueprintStatus::idle();
            instance.end_operation(OperationStatus::Ok, None);
        } else {
            let detail = outcome.detail.clone().unwrap_or_default();
            instance.status = BlueprintStatus::failed(detail.clone());
            instance.end_operation(OperationStatus::Error, Some(detail));
        }
        self.persist().await;

        let event_type = if outcome.is_ok() {
            ok_event
        } else {
            BlueprintEventType::Error
        };
        self.emit(event_type, Some(&outcome));
        send_reply(reply, outcome);
    }

    async fn day0(&mut self, path: String, payload: Value, reply: Option<Reply>) {
        let id = self.id();
        info!(blueprint_id = %id, blueprint_type = %self.name, "Starting DAY0");

        let instance = self.ctx.instance_mut();
        instance.begin_operation(WorkerMessageType::Day0, &path);
        instance.status = BlueprintStatus::deploying(&id);
        instance.config_snapshot = Some(payload.clone());
        self.persist().await;
        self.emit(BlueprintEventType::StartedDay0, None);

        let outcome = match self.blueprint.deploy(&mut self.ctx, payload).await {
            Ok(()) => {
                info!(blueprint_id = %id, "DAY0 finished");
                OperationOutcome::ok(id, "DAY0", None)
            }
            Err(e) => {
                error!(blueprint_id = %id, error = %e, "DAY0 failed");
                OperationOutcome::error(id, "DAY0", e.to_string())
            }
        };
        self.finish(outcome, BlueprintEventType::Created, reply).await;
    }

    async fn day2(
        &mut self,
        kind: WorkerMessageType,
        path: String,
        operation: Operation,
        payload: Value,
        reply: Option<Reply>,
    ) {
        let id = self.id();
        info!(blueprint_id = %id, operation = %path, kind = %kind, "Starting DAY2");

        let instance = self.ctx.instance_mut();
        instance.begin_operation(kind, &path);
        instance.status = BlueprintStatus::running_day2(&id, &path);
        if kind == WorkerMessageType::Day2 && !payload.is_null() {
            instance
                .day2_call_history
                .push(json!({ "path": path, "payload": payload }));
        }
        self.persist().await;
        self.emit(BlueprintEventType::StartedDay2, None);

        let result = operation
            .invoke(self.blueprint.as_mut(), &mut self.ctx, payload)
            .await;
        let outcome = match result {
            Ok(result) => {
                debug!(blueprint_id = %id, operation = %path, "DAY2 finished");
                OperationOutcome::ok(id, path, Some(result))
            }
            Err(e) => {
                error!(blueprint_id = %id, operation = %path, error = %e, "DAY2 failed");
                OperationOutcome::error(id, path, e.to_string())
            }
        };
        self.finish(outcome, BlueprintEventType::EndDay2, reply).await;
    }

    async fn stop(&mut self, reply: Option<Reply>) {
        let id = self.id();
        info!(blueprint_id = %id, "Tearing down blueprint");

        let instance = self.ctx.instance_mut();
        instance.begin_operation(WorkerMessageType::Stop, "STOP");
        instance.status = BlueprintStatus::destroying(&id);
        self.emit(BlueprintEventType::StartTeardown, None);
        self.persist().await;

        let outcome = match self.blueprint.teardown(&mut self.ctx).await {
            Ok(()) => {
                if let Err(e) = self.ctx.store().delete(&id).await {
                    warn!(blueprint_id = %id, error = %e, "Failed to delete blueprint record");
                }
                OperationOutcome::ok(id, "STOP", None)
            }
            Err(e) => {
                error!(blueprint_id = %id, error = %e, "Teardown failed, keeping record");
                let detail = e.to_string();
                let instance = self.ctx.instance_mut();
                instance.status.mark_error(detail.clone());
                instance.end_operation(OperationStatus::Error, Some(detail.clone()));
                self.persist().await;
                OperationOutcome::error(id, "STOP", detail)
            }
        };

        send_reply(reply, outcome.clone());
        self.emit(BlueprintEventType::Deleted, Some(&outcome));
    }
}

fn send_reply(reply: Option<Reply>, outcome: OperationOutcome) {
    if let Some(reply) = reply {
        // The caller may have timed out and gone away.
        let _ = reply.send(outcome);
    }
}

#[async_trait]
impl Actor for BlueprintWorker {
    type Message = WorkerMessage;

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &mut self,
        msg: WorkerMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        // A cancellation only ever targets the operation in flight.
        self.cancel.reset();

        match msg {
            WorkerMessage::Day0 { path, payload, reply } => {
                self.day0(path, payload, reply).await;
                Ok(true)
            }
            WorkerMessage::Day2 {
                path,
                operation,
                payload,
                reply,
            } => {
                self.day2(WorkerMessageType::Day2, path, operation, payload, reply)
                    .await;
                Ok(true)
            }
            WorkerMessage::Day2ByName {
                name,
                operation,
                args,
                reply,
            } => {
                self.day2(WorkerMessageType::Day2ByName, name, operation, args, reply)
                    .await;
                Ok(true)
            }
            WorkerMessage::Stop { reply } => {
                self.stop(reply).await;
                Ok(false)
            }
        }
    }
}

/// Errors from a synchronous call into a worker.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("worker stopped")]
    Stopped,

    #[error("no reply after {0:?}")]
    Timeout(Duration),
}

/// Cloneable handle to a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    id: BlueprintId,
    blueprint_type: String,
    handle: ActorHandle<WorkerMessage>,
    cancel: Arc<CancelTrigger>,
    stopping: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn id(&self) -> BlueprintId {
        self.id
    }

    pub fn blueprint_type(&self) -> &str {
        &self.blueprint_type
    }

    /// Enqueue a message without waiting for it.
    pub fn put(&self, msg: WorkerMessage) -> Result<(), ActorError> {
        debug!(blueprint_id = %self.id, kind = %msg.kind(), "Enqueue message");
        self.handle.send(msg)
    }

    /// Enqueue the message built by `make` and wait for its outcome.
    ///
    /// On timeout the message stays queued or keeps running.
    pub async fn call<F>(&self, make: F, timeout: Duration) -> Result<OperationOutcome, CallError>
    where
        F: FnOnce(Reply) -> WorkerMessage,
    {
        let (tx, rx) = oneshot::channel();
        self.put(make(tx)).map_err(|_| CallError::Stopped)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(CallError::Stopped),
            Err(_) => Err(CallError::Timeout(timeout)),
        }
    }

    /// Raise the cancellation flag of the operation in flight.
    pub fn cancel_in_flight(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_closed()
    }

    /// Claim the teardown of this worker. Only the first caller gets `true`;
    /// STOP must be enqueued by that caller alone.
    pub fn begin_stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::SeqCst)
    }

    /// Whether a STOP has been claimed for this worker.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Resolves once the worker loop has exited.
    pub async fn stopped(&self) {
        self.handle.closed().await
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("blueprint_type", &self.blueprint_type)
            .field("actor_id", &self.handle.actor_id())
            .finish()
    }
}

/// Start a worker for `instance` driving `blueprint`.
pub fn spawn_worker(
    blueprint: Box<dyn DynBlueprint>,
    instance: BlueprintInstance,
    env: &WorkerEnv,
) -> WorkerHandle {
    let id = instance.id;
    let blueprint_type = instance.blueprint_type.clone();
    let cancel = Arc::new(CancelTrigger::new());
    let ctx = BlueprintContext::new(
        instance,
        env.store.clone(),
        env.providers.clone(),
        env.children.clone(),
        cancel.signal(),
    );
    let worker = BlueprintWorker {
        blueprint,
        ctx,
        events: env.events.clone(),
        cancel: cancel.clone(),
        name: format!("worker_{blueprint_type}"),
    };

    // The task ends on STOP; nothing awaits it.
    let (handle, _task) = spawn_actor(worker);
    WorkerHandle {
        id,
        blueprint_type,
        handle,
        cancel,
        stopping: Arc::new(AtomicBool::new(false)),
    }
}
