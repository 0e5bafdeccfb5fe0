//! Long-lived host for the supervisor and executor.
//!
//! The carrier is an actor: one inbound channel of [`CarrierMessage`]s, read
//! by a single control loop that also owns the wake lock and foreground
//! indicator. A start is handled on the loop itself, so any request that
//! follows it for the same id sees the process. Exec runs on worker tasks.
//! Replies go to the [`ClientAddress`] captured with each request.

pub mod client;
pub mod posture;
pub mod protocol;

pub use client::{ClientAddress, ClientSink};
pub use posture::{
    FOREGROUND_KEY, ForegroundIndicator, LoggingIndicator, LoggingWakeLock, Posture, WakeLock,
};
pub use protocol::{ControlAction, ControlMessage, Inbound, Reply, ReplyAction, Request, Verb};

use crate::config::CarrierConfig;
use crate::executor::Executor;
use crate::factory::PlatformManager;
use crate::supervisor::Supervisor;
use procrelay_core::{KeyValueStore, ProcessManager, RelayError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Message accepted by the carrier's control loop
#[derive(Debug)]
pub enum CarrierMessage {
    Request {
        request: Request,
        reply_to: Option<ClientAddress>,
    },
    Control(ControlAction),
    Shutdown,
}

/// Sending side of a running carrier
pub struct CarrierHandle {
    tx: mpsc::UnboundedSender<CarrierMessage>,
    task: JoinHandle<()>,
}

impl CarrierHandle {
    pub fn send(&self, message: CarrierMessage) -> Result<(), RelayError> {
        self.tx.send(message).map_err(|_| RelayError::CarrierClosed)
    }

    pub fn request(
        &self,
        request: Request,
        reply_to: Option<ClientAddress>,
    ) -> Result<(), RelayError> {
        self.send(CarrierMessage::Request { request, reply_to })
    }

    pub fn control(&self, action: ControlAction) -> Result<(), RelayError> {
        self.send(CarrierMessage::Control(action))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Stop the carrier and wait until every tracked process is killed.
    pub async fn shutdown(self) {
        // Already gone after exit-carrier.
        let _ = self.tx.send(CarrierMessage::Shutdown);
        if let Err(e) = self.task.await {
            error!("Carrier task failed: {}", e);
        }
    }
}

/// Carrier configuration and collaborators, ready to [`spawn`](Carrier::spawn)
pub struct Carrier<M: ProcessManager + 'static = PlatformManager> {
    config: CarrierConfig,
    manager: Arc<M>,
    store: Arc<dyn KeyValueStore>,
    wake_lock: Box<dyn WakeLock>,
    indicator: Box<dyn ForegroundIndicator>,
}

impl<M: ProcessManager + 'static> Carrier<M> {
    pub fn new(config: CarrierConfig, manager: Arc<M>, store: Arc<dyn KeyValueStore>) -> Self {
        let wake_lock = Box::new(LoggingWakeLock::new(config.wake_lock_tag.clone()));
        Self {
            config,
            manager,
            store,
            wake_lock,
            indicator: Box::new(LoggingIndicator),
        }
    }

    pub fn with_wake_lock(mut self, wake_lock: Box<dyn WakeLock>) -> Self {
        self.wake_lock = wake_lock;
        self
    }

    pub fn with_indicator(mut self, indicator: Box<dyn ForegroundIndicator>) -> Self {
        self.indicator = indicator;
        self
    }

    /// Start the control loop on the current runtime.
    pub fn spawn(self) -> CarrierHandle {
        let Carrier {
            config,
            manager,
            store,
            wake_lock,
            indicator,
        } = self;

        let stopping = CancellationToken::new();
        let actor = CarrierActor {
            supervisor: Arc::new(Supervisor::new(manager.clone(), config.drain_timeout())),
            executor: Arc::new(Executor::with_cancellation(manager, stopping.clone())),
            posture: Posture::new(wake_lock, indicator, store, config.foreground_by_default),
            workers: TaskTracker::new(),
            stopping,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(actor.run(rx));
        CarrierHandle { tx, task }
    }
}

struct CarrierActor<M: ProcessManager + 'static> {
    supervisor: Arc<Supervisor<M>>,
    executor: Arc<Executor<M>>,
    posture: Posture,
    workers: TaskTracker,
    stopping: CancellationToken,
}

impl<M: ProcessManager + 'static> CarrierActor<M> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CarrierMessage>) {
        self.posture.start();
        info!("Carrier started");

        while let Some(message) = rx.recv().await {
            match message {
                CarrierMessage::Request { request, reply_to } => {
                    self.dispatch(request, reply_to).await
                }
                CarrierMessage::Control(ControlAction::ExitCarrier) | CarrierMessage::Shutdown => {
                    break;
                }
                CarrierMessage::Control(action) => self.apply(action),
            }
        }

        rx.close();
        self.shutdown().await;
    }

    fn apply(&mut self, action: ControlAction) {
        debug!("Control action {:?}", action);
        match action {
            ControlAction::EnterForeground => self.posture.enter_foreground(),
            ControlAction::EnterBackground => self.posture.enter_background(),
            ControlAction::ToggleWakeLock => self.posture.toggle_wake_lock(),
            ControlAction::ExitCarrier => {}
        }
    }

    async fn dispatch(&self, request: Request, reply_to: Option<ClientAddress>) {
        debug!("Dispatching {:?} for '{}'", request.verb, request.id);
        match request.verb {
            Verb::Start => self.start(request, reply_to).await,
            Verb::Write => self.write(request),
            Verb::Stop => {
                if let Err(e) = self.supervisor.stop(&request.id) {
                    warn!("Stop of '{}' failed: {}", request.id, e);
                }
            }
            Verb::IsRunning => {
                let state = self.supervisor.status(&request.id);
                send_reply(
                    reply_to.as_ref(),
                    Reply::new(request.id, ReplyAction::IsRunning, state.as_str()),
                );
            }
            Verb::Exec => self.exec(request, reply_to),
        }
    }

    async fn start(&self, request: Request, reply_to: Option<ClientAddress>) {
        let Some(address) = reply_to else {
            warn!("Ignoring start of '{}' without a reply address", request.id);
            return;
        };
        // Replies are keyed by id, so the client must name the process.
        if request.id.is_empty() {
            reject_start(&address, &request.id, "missing id");
            return;
        }
        let Some(command) = request.command.as_deref() else {
            reject_start(&address, &request.id, "missing command");
            return;
        };

        let sink = Arc::new(ClientSink::new(address.clone()));
        match self
            .supervisor
            .start(Some(request.id.clone()), command, request.sandboxed(), sink)
            .await
        {
            Ok(started) => debug!("Process '{}' started", started),
            // The sink already carried the failure.
            Err(e) if e.is_spawn_failure() => {}
            Err(e) => {
                warn!("Start of '{}' rejected: {}", request.id, e);
                send_reply(
                    Some(&address),
                    Reply::new(request.id, ReplyAction::Stderr, e.to_string()),
                );
            }
        }
    }

    fn write(&self, request: Request) {
        let input = request.input.unwrap_or_default();
        let pending = match self.supervisor.enqueue_write(&request.id, &input) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Write to '{}' failed: {}", request.id, e);
                return;
            }
        };

        let id = request.id;
        self.workers.spawn(async move {
            match pending.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Write to '{}' failed: {}", id, e),
                Err(_) => warn!("Write to '{}' was dropped", id),
            }
        });
    }

    fn exec(&self, request: Request, reply_to: Option<ClientAddress>) {
        let Some(command) = request.command.clone() else {
            send_reply(
                reply_to.as_ref(),
                Reply::exec_exception(request.id, "missing command"),
            );
            return;
        };

        let sandboxed = request.sandboxed();
        let executor = self.executor.clone();
        let id = request.id;

        self.workers.spawn(async move {
            let reply = match executor.execute(&command, sandboxed).await {
                Ok(result) => Reply::exec_result(id, &result),
                Err(RelayError::CarrierClosed) => {
                    debug!("Exec of '{}' abandoned by shutdown", id);
                    return;
                }
                Err(RelayError::Execution(message)) => Reply::exec_exception(id, &message),
                Err(e) => Reply::exec_exception(id, &e.to_string()),
            };
            send_reply(reply_to.as_ref(), reply);
        });
    }

    async fn shutdown(mut self) {
        info!("Carrier shutting down");
        self.posture.shutdown();
        self.stopping.cancel();
        self.workers.close();
        self.supervisor.shutdown().await;
        self.workers.wait().await;
        info!("Carrier stopped");
    }
}

fn reject_start(address: &ClientAddress, id: &str, reason: &str) {
    warn!("Rejecting start of '{}': {}", id, reason);
    send_reply(
        Some(address),
        Reply::new(id, ReplyAction::Stderr, format!("Failed to start process: {reason}")),
    );
    send_reply(Some(address), Reply::new(id, ReplyAction::Exit, "1"));
}

fn send_reply(address: Option<&ClientAddress>, reply: Reply) {
    match address {
        Some(address) => {
            if address.send(reply).is_err() {
                debug!("Client went away before its reply");
            }
        }
        None => debug!("No reply address for {:?} of '{}'", reply.action, reply.id),
    }
}
