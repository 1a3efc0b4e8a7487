//! Core actor framework types and traits.
//!
//! Provides the fundamental building blocks for the actor system:
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for sending messages to actors
//! - `spawn_actor` to run an actor on its own task

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext) -> Result<bool, ActorError>;

    /// Called when the actor starts.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        // Default: no cleanup
    }
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    /// Actor's unique ID.
    pub actor_id: String,

    /// Message counter.
    pub messages_processed: u64,
}

impl ActorContext {
    /// Create a new actor context.
    pub fn new(actor_id: String) -> Self {
        Self {
            actor_id,
            messages_processed: 0,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
///
/// The mailbox is unbounded: sending never blocks the caller.
pub struct ActorHandle<M: Message> {
    /// Sender for the actor's mailbox.
    tx: mpsc::UnboundedSender<M>,

    /// Actor ID for logging.
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor.
    pub fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).map_err(|_| ActorError::ActorStopped)
    }

    /// Whether the actor has stopped receiving.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the actor has stopped receiving.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Get the actor ID.
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Spawn `actor` on its own task.
pub fn spawn_actor<A: Actor>(actor: A) -> (ActorHandle<A::Message>, JoinHandle<()>) {
    let actor_id = format!("{}_{}", actor.name(), generate_actor_id());
    let (tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(run_actor_loop(actor, rx, actor_id.clone()));
    debug!(actor_id = %actor_id, "Spawned actor");

    (ActorHandle { tx, actor_id }, task)
}

// =============================================================================
// Actor Loop
// =============================================================================

/// Run the main actor loop.
async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::UnboundedReceiver<A::Message>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    debug!(actor_id = %actor_id, "Actor started");

    while let Some(msg) = rx.recv().await {
        ctx.messages_processed += 1;

        match actor.handle(msg, &mut ctx).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(actor_id = %actor_id, "Actor requested stop");
                break;
            }
            Err(e) => {
                error!(actor_id = %actor_id, error = %e, "Actor error");
            }
        }
    }

    // Close the mailbox so senders observe the stop.
    rx.close();

    actor.on_stop(&mut ctx).await;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Debug)]
    enum TestMessage {
        Push(u32),
        Stop,
    }

    struct Collector {
        seen: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl Actor for Collector {
        type Message = TestMessage;

        fn name(&self) -> &str {
            "collector"
        }

        async fn handle(
            &mut self,
            msg: TestMessage,
            _ctx: &mut ActorContext,
        ) -> Result<bool, ActorError> {
            match msg {
                TestMessage::Push(n) => {
                    // Yield so that a concurrent handler would interleave.
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    self.seen.lock().await.push(n);
                    Ok(true)
                }
                TestMessage::Stop => Ok(false),
            }
        }
    }

    #[tokio::test]
    async fn test_messages_processed_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (handle, task) = spawn_actor(Collector { seen: seen.clone() });

        for n in 0..20 {
            handle.send(TestMessage::Push(n)).unwrap();
        }
        handle.send(TestMessage::Stop).unwrap();
        task.await.unwrap();

        assert_eq!(*seen.lock().await, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (handle, task) = spawn_actor(Collector { seen });
        handle.send(TestMessage::Stop).unwrap();
        task.await.unwrap();

        assert!(handle.is_closed());
        handle.closed().await;
        assert!(matches!(
            handle.send(TestMessage::Push(1)),
            Err(ActorError::ActorStopped)
        ));
    }

    #[tokio::test]
    async fn test_closed_resolves_when_actor_stops() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (handle, _task) = spawn_actor(Collector { seen: seen.clone() });

        let watcher = handle.clone();
        let waiting = tokio::spawn(async move { watcher.closed().await });
        handle.send(TestMessage::Push(7)).unwrap();
        assert!(!handle.is_closed());

        handle.send(TestMessage::Stop).unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*seen.lock().await, vec![7]);
    }

    #[test]
    fn test_actor_ids_are_unique() {
        assert_ne!(generate_actor_id(), generate_actor_id());
    }
}
