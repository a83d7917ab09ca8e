//! Host side of the service channel.
//!
//! Flow:
//! 1. `start()` binds an inbound endpoint on a background task, then launches
//!    the worker with that endpoint as its startup argument
//! 2. The background task receives READY and schedules an outbound connect
//! 3. The designated thread (whoever owns the listener) runs that connect from
//!    `poll()`, dispatches a local READY and marks the channel ready
//! 4. Commands flow both ways until `soft_quit()`/STOPPED or `stop()`
//!
//! Every other incoming message goes to the host's [`HostDispatcher`] on the
//! background task's blocking pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::protocol::{Message, PING, QUIT, READY, STOPPED, Value, validate_command};
use crate::bridge::transport::{Endpoint, OutboundLink, bind_ephemeral, serve_inbound};
use crate::config::ChannelConfig;
use crate::dispatch::CommandDispatcher;
use crate::error::ChannelError;
use crate::launcher::{ServiceDescriptor, ServiceLauncher};
use crate::state::{ChannelFlags, ChannelPhase, ChannelStatus};
use crate::task_queue::{TaskQueue, TaskSender};

/// Host handlers take no context; they capture whatever they need.
pub type HostDispatcher = CommandDispatcher<()>;

/// Work the background task hands to the designated thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredTask {
    ConnectOutbound(Endpoint),
}

#[derive(Debug)]
struct ChannelTask {
    endpoint: Endpoint,
    quit: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Everything the background task needs, and nothing the designated thread owns.
struct ChannelLoop {
    flags: Arc<ChannelFlags>,
    dispatcher: Arc<HostDispatcher>,
    tasks: TaskSender<DeferredTask>,
    quit: Arc<AtomicBool>,
    poll_interval: Duration,
    inbound_capacity: usize,
}

pub struct ChannelListener {
    config: ChannelConfig,
    launcher: Box<dyn ServiceLauncher>,
    dispatcher: Arc<HostDispatcher>,
    runtime: Runtime,
    flags: Arc<ChannelFlags>,
    tasks: TaskQueue<DeferredTask>,
    channel: Option<ChannelTask>,
    outbound: Option<OutboundLink>,
    phase: ChannelPhase,
}

impl std::fmt::Debug for ChannelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelListener")
            .field("service", &self.launcher.descriptor().name())
            .field("phase", &self.phase)
            .field("endpoint", &self.endpoint())
            .field("child_endpoint", &self.flags.child_endpoint())
            .finish_non_exhaustive()
    }
}

impl ChannelListener {
    pub fn new(
        launcher: Box<dyn ServiceLauncher>,
        dispatcher: HostDispatcher,
    ) -> Result<Self, ChannelError> {
        Self::with_config(launcher, dispatcher, ChannelConfig::from_env())
    }

    pub fn with_config(
        launcher: Box<dyn ServiceLauncher>,
        dispatcher: HostDispatcher,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("servicelink-channel")
            .enable_all()
            .build()?;
        Ok(Self {
            config,
            launcher,
            dispatcher: Arc::new(dispatcher),
            runtime,
            flags: Arc::new(ChannelFlags::new()),
            tasks: TaskQueue::new(),
            channel: None,
            outbound: None,
            phase: ChannelPhase::Stopped,
        })
    }

    /// Bind the channel if needed and launch the worker.
    ///
    /// A no-op while the launcher reports the worker running and the channel
    /// is either connected or still waiting on that worker's READY. Does not
    /// wait for READY; see [`wait_ready`](Self::wait_ready).
    pub fn start(&mut self) -> Result<(), ChannelError> {
        let live = self
            .channel
            .as_ref()
            .filter(|channel| !channel.handle.is_finished())
            .map(|channel| channel.endpoint);
        if (self.outbound.is_some() || live.is_some()) && self.launcher.is_running() {
            tracing::debug!(service = self.service_name(), phase = ?self.phase, "Channel already started");
            return Ok(());
        }

        self.phase = ChannelPhase::Launching;
        self.outbound = None;
        let endpoint = match live {
            Some(endpoint) => {
                self.flags.reset();
                let stale = self.tasks.clear();
                if stale > 0 {
                    tracing::debug!(stale, "Discarded deferred tasks from a previous cycle");
                }
                endpoint
            }
            None => match self.spawn_channel() {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    self.phase = ChannelPhase::Stopped;
                    return Err(e);
                }
            },
        };
        self.phase = ChannelPhase::ChannelBound;

        if let Err(e) = self.launcher.start(&endpoint.to_string()) {
            self.phase = ChannelPhase::Stopped;
            return Err(e.into());
        }
        self.phase = ChannelPhase::AwaitingReady;
        tracing::info!(service = self.service_name(), %endpoint, "Service launched, awaiting READY");
        Ok(())
    }

    /// Bind a new inbound endpoint and start its channel task. Each task gets
    /// its own flags and queue, so a task left over from an earlier cycle
    /// cannot touch this one.
    fn spawn_channel(&mut self) -> Result<Endpoint, ChannelError> {
        let (listener, endpoint) = self
            .runtime
            .block_on(bind_ephemeral(self.config.bind_host))?;
        self.flags = Arc::new(ChannelFlags::new());
        self.tasks = TaskQueue::new();
        let quit = Arc::new(AtomicBool::new(false));
        let channel_loop = ChannelLoop {
            flags: Arc::clone(&self.flags),
            dispatcher: Arc::clone(&self.dispatcher),
            tasks: self.tasks.sender(),
            quit: Arc::clone(&quit),
            poll_interval: self.config.poll_interval,
            inbound_capacity: self.config.inbound_capacity,
        };
        let handle = self.runtime.spawn(channel_loop.run(listener));
        tracing::debug!(%endpoint, "Channel task started");
        self.channel = Some(ChannelTask {
            endpoint,
            quit,
            handle,
        });
        Ok(endpoint)
    }

    /// Run deferred work. Must be called regularly from the designated thread;
    /// `wait_ready` and `wait_stopped` call it for you.
    pub fn poll(&mut self) {
        self.reap_crashed_channel();
        let pending: Vec<DeferredTask> = self.tasks.drain().collect();
        for task in pending {
            match task {
                DeferredTask::ConnectOutbound(endpoint) => self.connect_outbound(endpoint),
            }
        }
    }

    fn reap_crashed_channel(&mut self) {
        let finished = self
            .channel
            .as_ref()
            .is_some_and(|channel| channel.handle.is_finished());
        if !finished {
            return;
        }
        if let Some(channel) = self.channel.take() {
            match self.runtime.block_on(channel.handle) {
                Ok(()) => tracing::warn!(endpoint = %channel.endpoint, "Channel task exited"),
                Err(e) => tracing::error!(endpoint = %channel.endpoint, error = %e, "Channel task crashed"),
            }
        }
    }

    fn connect_outbound(&mut self, endpoint: Endpoint) {
        if self.outbound.is_some() || !self.flags.can_bind() {
            tracing::trace!(%endpoint, "Skipping outbound connect");
            return;
        }
        match self.runtime.block_on(OutboundLink::connect(endpoint)) {
            Ok(link) => {
                self.outbound = Some(link);
                self.phase = ChannelPhase::Ready;
                tracing::info!(service = self.service_name(), %endpoint, "Channel ready");
                let ready = Message::new(READY, vec![Value::from(endpoint.to_string())]);
                self.dispatcher.dispatch(&mut (), &ready);
                self.flags.mark_ready();
            }
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "Outbound connect failed, retrying");
                self.tasks
                    .sender()
                    .schedule(DeferredTask::ConnectOutbound(endpoint));
            }
        }
    }

    /// Poll until the handshake completes.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        let started = Instant::now();
        loop {
            self.poll();
            if self.is_ready() {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= timeout {
                tracing::warn!(service = self.service_name(), ?waited, "Timed out waiting for READY");
                return Err(ChannelError::Timeout { waited });
            }
            self.flags
                .wait_for_change((timeout - waited).min(self.config.poll_interval));
        }
    }

    /// Poll until the worker reports STOPPED. Returns whether it did.
    pub fn wait_stopped(&mut self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            self.poll();
            if self.flags.is_stopped() {
                return true;
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return false;
            }
            self.flags
                .wait_for_change((timeout - waited).min(self.config.poll_interval));
        }
    }

    /// Send a command to the worker.
    pub fn send(&mut self, command: &str, args: Vec<Value>) -> Result<(), ChannelError> {
        let link = match self.outbound.as_mut() {
            Some(link) if self.phase.can_send() => link,
            _ => {
                return Err(ChannelError::NotReady {
                    command: command.to_string(),
                });
            }
        };
        validate_command(command)?;
        self.runtime.block_on(link.send(Message::new(command, args)))?;
        if self.phase == ChannelPhase::Ready {
            self.phase = ChannelPhase::Running;
        }
        Ok(())
    }

    /// Ask the worker to exit. STOPPED arrives later; see [`wait_stopped`](Self::wait_stopped).
    pub fn soft_quit(&mut self) -> Result<(), ChannelError> {
        self.send(QUIT, Vec::new())?;
        self.phase = ChannelPhase::SoftQuitSent;
        Ok(())
    }

    /// Send PING with the current unix time in milliseconds. Returns the token;
    /// the matching PONG goes to the dispatcher.
    pub fn ping(&mut self) -> Result<i64, ChannelError> {
        let token = chrono::Utc::now().timestamp_millis();
        self.send(PING, vec![Value::Int(token)])?;
        Ok(token)
    }

    /// Stop the worker and tear the channel down.
    pub fn stop(&mut self) {
        self.launcher.stop();
        if let Some(channel) = self.channel.take() {
            channel.quit.store(true, Ordering::Release);
        }
        if let Some(link) = self.outbound.take()
            && let Err(e) = self.runtime.block_on(link.close())
        {
            tracing::debug!(error = %e, "Outbound link close failed");
        }
        self.tasks.clear();
        self.phase = ChannelPhase::Stopped;
        tracing::info!(service = self.service_name(), "Service stopped");
    }

    pub fn restart(&mut self) -> Result<(), ChannelError> {
        self.stop();
        self.start()
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            phase: self.phase,
            ready: self.flags.is_ready(),
            stopped: self.flags.is_stopped(),
            can_bind: self.flags.can_bind(),
            endpoint: self.endpoint().map(|e| e.to_string()),
            child_endpoint: self.flags.child_endpoint().map(|e| e.to_string()),
        }
    }

    /// The host's inbound endpoint, while the channel task exists.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.channel.as_ref().map(|channel| channel.endpoint)
    }

    pub fn child_endpoint(&self) -> Option<Endpoint> {
        self.flags.child_endpoint()
    }

    pub fn is_ready(&self) -> bool {
        self.outbound.is_some() && self.flags.is_ready()
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.is_stopped()
    }

    pub fn is_running(&self) -> bool {
        self.launcher.is_running()
    }

    /// Worker pid, for launchers that know one.
    pub fn pid(&self) -> Option<u32> {
        self.launcher.pid()
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        self.launcher.descriptor()
    }

    fn service_name(&self) -> &str {
        self.launcher.descriptor().name()
    }
}

impl ChannelLoop {
    async fn run(self, listener: TcpListener) {
        let (tx, mut rx) = mpsc::channel(self.inbound_capacity);
        let inbound = tokio::spawn(serve_inbound(listener, tx));

        while !self.quit.load(Ordering::Acquire) {
            match tokio::time::timeout(self.poll_interval, rx.recv()).await {
                Err(_elapsed) => continue,
                Ok(None) => {
                    tracing::warn!("Inbound endpoint closed");
                    break;
                }
                Ok(Some(message)) => self.route(message).await,
            }
        }

        inbound.abort();
        tracing::debug!("Channel task finished");
    }

    async fn route(&self, message: Message) {
        match message.command.as_str() {
            READY => match ready_endpoint(&message) {
                Some(endpoint) => {
                    tracing::debug!(%endpoint, "Worker reported READY");
                    self.flags.mark_can_bind(endpoint);
                    if !self.tasks.schedule(DeferredTask::ConnectOutbound(endpoint)) {
                        tracing::warn!("Listener gone, dropping outbound connect");
                    }
                }
                None => tracing::warn!(%message, "READY without a usable endpoint"),
            },
            STOPPED => {
                tracing::info!("Worker reported STOPPED");
                self.flags.mark_stopped();
            }
            _ => {
                let dispatcher = Arc::clone(&self.dispatcher);
                let command = message.command.clone();
                let dispatched =
                    tokio::task::spawn_blocking(move || dispatcher.dispatch(&mut (), &message)).await;
                match dispatched {
                    Ok(route) => tracing::trace!(%command, ?route, "Dispatched"),
                    Err(e) => tracing::error!(%command, error = %e, "Host handler panicked"),
                }
            }
        }
    }
}

/// READY carries the worker endpoint as a string, or as a bare port.
fn ready_endpoint(message: &Message) -> Option<Endpoint> {
    match message.arg(0)? {
        Value::Str(s) => s.parse().ok(),
        Value::Int(port) => u16::try_from(*port).ok().map(Endpoint::loopback),
        _ => None,
    }
}
