//! Worker side of the service channel.
//!
//! Flow:
//! 1. Read the host endpoint from `SERVICELINK_ARGUMENT`
//! 2. Bind our own inbound endpoint, connect the primary link to the host
//! 3. Send READY with our endpoint
//! 4. Dispatch incoming commands until a handler (or QUIT) sets the quit flag
//!
//! Handlers run on the thread that called [`ChildRuntime::run`]. Other threads
//! reach the host through a [`ChannelContext`] obtained from a [`RuntimeHandle`].

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::bridge::protocol::{Message, PING, PONG, QUIT, READY, STOPPED, Value, validate_command};
use crate::bridge::transport::{
    Endpoint, OutboundLink, SERVICE_ARGUMENT_ENV, bind_ephemeral, serve_inbound,
};
use crate::config::ChannelConfig;
use crate::dispatch::CommandDispatcher;
use crate::error::ChannelError;

pub type WorkerDispatcher = CommandDispatcher<ChildSession>;

/// Builder and event loop for a worker process.
#[derive(Debug)]
pub struct ChildRuntime {
    config: ChannelConfig,
    dispatcher: WorkerDispatcher,
}

impl Default for ChildRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildRuntime {
    /// Runtime with the built-in QUIT and PING handlers registered.
    pub fn new() -> Self {
        let dispatcher = CommandDispatcher::new()
            .on(QUIT, |session: &mut ChildSession, _: &Message| {
                let acked = session.send(STOPPED, Vec::new());
                session.quit();
                Ok(acked?)
            })
            .on(PING, |session: &mut ChildSession, msg: &Message| {
                Ok(session.send(PONG, msg.args.clone())?)
            });
        Self {
            config: ChannelConfig::from_env(),
            dispatcher,
        }
    }

    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a handler. Registering QUIT or PING replaces the built-in.
    pub fn on<F>(mut self, command: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut ChildSession, &Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.register(command, handler);
        self
    }

    pub fn with_fallback<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut ChildSession, &Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.set_fallback(handler);
        self
    }

    /// Run with the host endpoint taken from the environment.
    pub fn run(self) -> Result<(), ChannelError> {
        let arg = std::env::var(SERVICE_ARGUMENT_ENV)
            .map_err(|_| ChannelError::MissingArgument(SERVICE_ARGUMENT_ENV))?;
        self.run_with_argument(&arg)
    }

    /// Run against the host endpoint in `arg`. Returns once the quit flag is
    /// set or the inbound endpoint closes.
    pub fn run_with_argument(self, arg: &str) -> Result<(), ChannelError> {
        let host: Endpoint = arg.parse()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("servicelink-worker")
            .enable_all()
            .build()?;

        let (listener, endpoint) = runtime.block_on(bind_ephemeral(self.config.bind_host))?;
        let primary = runtime.block_on(OutboundLink::connect(host))?;
        let (tx, mut rx) = mpsc::channel(self.config.inbound_capacity);
        let inbound = runtime.spawn(serve_inbound(listener, tx));

        let mut session = ChildSession {
            shared: Arc::new(SessionShared {
                host,
                endpoint,
                handle: runtime.handle().clone(),
                primary: Mutex::new(Some(primary)),
                owner: thread::current().id(),
                quit: AtomicBool::new(false),
            }),
        };

        session.send(READY, vec![Value::from(endpoint.to_string())])?;
        tracing::info!(%host, %endpoint, "Worker channel ready");

        let poll_interval = self.config.poll_interval;
        while !session.is_quitting() {
            // The timer must be created inside the runtime context.
            let next = runtime.block_on(async {
                tokio::time::timeout(poll_interval, rx.recv()).await
            });
            match next {
                Err(_elapsed) => continue,
                Ok(None) => {
                    tracing::warn!("Inbound endpoint closed, stopping worker loop");
                    break;
                }
                Ok(Some(message)) => {
                    let route = self.dispatcher.dispatch(&mut session, &message);
                    tracing::trace!(command = %message.command, ?route, "Dispatched");
                }
            }
        }

        inbound.abort();
        let primary = session
            .shared
            .primary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(link) = primary
            && let Err(e) = runtime.block_on(link.close())
        {
            tracing::debug!(error = %e, "Primary link close failed");
        }
        tracing::info!(%endpoint, "Worker loop finished");
        Ok(())
    }
}

#[derive(Debug)]
struct SessionShared {
    host: Endpoint,
    endpoint: Endpoint,
    handle: Handle,
    primary: Mutex<Option<OutboundLink>>,
    owner: ThreadId,
    quit: AtomicBool,
}

impl SessionShared {
    fn send_primary(&self, message: Message) -> Result<(), ChannelError> {
        let mut primary = self.primary.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(link) = primary.as_mut() else {
            return Err(ChannelError::NotReady {
                command: message.command,
            });
        };
        self.handle.block_on(link.send(message))?;
        Ok(())
    }

    fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    fn is_quitting(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }
}

/// What a worker handler sees of the channel.
#[derive(Debug)]
pub struct ChildSession {
    shared: Arc<SessionShared>,
}

impl ChildSession {
    /// Send to the host over the primary link.
    pub fn send(&mut self, command: &str, args: Vec<Value>) -> Result<(), ChannelError> {
        validate_command(command)?;
        self.shared.send_primary(Message::new(command, args))
    }

    /// Leave the loop after the current handler returns.
    pub fn quit(&mut self) {
        self.shared.request_quit();
    }

    pub fn is_quitting(&self) -> bool {
        self.shared.is_quitting()
    }

    /// This worker's inbound endpoint.
    pub fn endpoint(&self) -> Endpoint {
        self.shared.endpoint
    }

    pub fn host_endpoint(&self) -> Endpoint {
        self.shared.host
    }

    pub fn get_context(&self) -> Result<ChannelContext, ChannelError> {
        ChannelContext::open(Arc::clone(&self.shared))
    }

    /// Handle for threads spawned by handlers.
    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Cloneable, `Send` access to a running worker from other threads.
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    shared: Arc<SessionShared>,
}

impl RuntimeHandle {
    /// Sender for the calling thread; see [`ChannelContext`].
    pub fn get_context(&self) -> Result<ChannelContext, ChannelError> {
        ChannelContext::open(Arc::clone(&self.shared))
    }

    pub fn request_quit(&self) {
        self.shared.request_quit();
    }

    pub fn is_quitting(&self) -> bool {
        self.shared.is_quitting()
    }
}

/// Per-thread sender to the host.
///
/// On the runtime's own thread the context shares the primary link. On any
/// other thread it owns a fresh connection to the host, which [`release`]
/// closes. Not `Send`: a context belongs to the thread that opened it.
///
/// Messages sent on an owned connection are not ordered against messages on
/// the primary link.
///
/// [`release`]: Self::release
#[derive(Debug)]
pub struct ChannelContext {
    link: Option<OutboundLink>,
    shared: Arc<SessionShared>,
    _thread_bound: PhantomData<*const ()>,
}

impl ChannelContext {
    fn open(shared: Arc<SessionShared>) -> Result<Self, ChannelError> {
        let link = if thread::current().id() == shared.owner {
            None
        } else {
            let link = shared.handle.block_on(OutboundLink::connect(shared.host))?;
            tracing::debug!(host = %shared.host, "Opened per-thread channel connection");
            Some(link)
        };
        Ok(Self {
            link,
            shared,
            _thread_bound: PhantomData,
        })
    }

    pub fn send(&mut self, command: &str, args: Vec<Value>) -> Result<(), ChannelError> {
        validate_command(command)?;
        let message = Message::new(command, args);
        match self.link.as_mut() {
            Some(link) => Ok(self.shared.handle.block_on(link.send(message))?),
            None => self.shared.send_primary(message),
        }
    }

    /// Whether this context sends over the runtime's primary link.
    pub fn is_shared(&self) -> bool {
        self.link.is_none()
    }

    /// Close an owned connection. A shared context has nothing to close.
    pub fn release(mut self) -> Result<(), ChannelError> {
        if let Some(link) = self.link.take() {
            self.shared.handle.block_on(link.close())?;
        }
        Ok(())
    }
}

impl Drop for ChannelContext {
    fn drop(&mut self) {
        if self.link.is_some() {
            tracing::debug!("Channel context dropped without release, closing connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::bridge::transport::LOOPBACK;

    /// Minimal stand-in for the host: an inbound endpoint whose messages land
    /// in a channel, served on its own runtime.
    struct FakeHost {
        runtime: tokio::runtime::Runtime,
        endpoint: Endpoint,
        rx: mpsc::Receiver<Message>,
    }

    impl FakeHost {
        fn new() -> Self {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();
            let (listener, endpoint): (TcpListener, Endpoint) =
                runtime.block_on(bind_ephemeral(LOOPBACK)).unwrap();
            let (tx, rx) = mpsc::channel(32);
            runtime.spawn(serve_inbound(listener, tx));
            Self {
                runtime,
                endpoint,
                rx,
            }
        }

        fn recv(&mut self) -> Message {
            let rx = &mut self.rx;
            self.runtime
                .block_on(async { tokio::time::timeout(Duration::from_secs(5), rx.recv()).await })
                .expect("timed out waiting for worker message")
                .expect("inbound closed")
        }

        fn connect(&self, endpoint: Endpoint) -> OutboundLink {
            self.runtime.block_on(OutboundLink::connect(endpoint)).unwrap()
        }

        fn send(&self, link: &mut OutboundLink, message: Message) {
            self.runtime.block_on(link.send(message)).unwrap();
        }
    }

    fn spawn_worker(runtime: ChildRuntime, host: Endpoint) -> thread::JoinHandle<Result<(), ChannelError>> {
        thread::spawn(move || runtime.run_with_argument(&host.to_string()))
    }

    fn ready_endpoint(host: &mut FakeHost) -> Endpoint {
        let ready = host.recv();
        assert_eq!(ready.command, READY);
        ready.arg(0).and_then(Value::as_str).unwrap().parse().unwrap()
    }

    #[test]
    fn bad_argument_is_rejected() {
        let err = ChildRuntime::new().run_with_argument("not an endpoint").unwrap_err();
        assert!(matches!(err, ChannelError::InvalidEndpoint(_)));
    }

    #[test]
    fn unreachable_host_is_io_error() {
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = ChildRuntime::new()
            .run_with_argument(&port.to_string())
            .unwrap_err();
        assert!(matches!(err, ChannelError::Io(_)));
    }

    #[test]
    fn handshake_quit_and_ping() {
        let mut host = FakeHost::new();
        let worker = spawn_worker(ChildRuntime::new(), host.endpoint);

        let endpoint = ready_endpoint(&mut host);
        let mut link = host.connect(endpoint);

        host.send(&mut link, Message::new(PING, vec![Value::Int(1234)]));
        let pong = host.recv();
        assert_eq!(pong, Message::new(PONG, vec![Value::Int(1234)]));

        host.send(&mut link, Message::bare(QUIT));
        assert_eq!(host.recv().command, STOPPED);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn custom_handlers_and_fallback() {
        let mut host = FakeHost::new();
        let runtime = ChildRuntime::new()
            .on("ECHO", |session: &mut ChildSession, msg: &Message| {
                Ok(session.send("ECHO", msg.args.clone())?)
            })
            .with_fallback(|session: &mut ChildSession, msg: &Message| {
                Ok(session.send("UNKNOWN", vec![Value::from(msg.command.clone())])?)
            });
        let worker = spawn_worker(runtime, host.endpoint);

        let endpoint = ready_endpoint(&mut host);
        let mut link = host.connect(endpoint);
        host.send(&mut link, Message::new("ECHO", vec!["hi".into()]));
        assert_eq!(host.recv(), Message::new("ECHO", vec!["hi".into()]));

        host.send(&mut link, Message::bare("WHAT"));
        assert_eq!(host.recv(), Message::new("UNKNOWN", vec!["WHAT".into()]));

        host.send(&mut link, Message::bare(QUIT));
        assert_eq!(host.recv().command, STOPPED);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn context_shares_primary_on_runtime_thread_and_owns_elsewhere() {
        let mut host = FakeHost::new();
        let runtime = ChildRuntime::new().on("PROBE", |session: &mut ChildSession, _: &Message| {
            let mut here = session.get_context()?;
            here.send("HERE", vec![Value::Bool(here.is_shared())])?;
            here.release()?;

            let handle = session.handle();
            thread::spawn(move || -> Result<(), ChannelError> {
                let mut there = handle.get_context()?;
                there.send("THERE", vec![Value::Bool(there.is_shared())])?;
                there.release()
            })
            .join()
            .map_err(|_| anyhow::anyhow!("context thread panicked"))??;
            Ok(())
        });
        let worker = spawn_worker(runtime, host.endpoint);

        let endpoint = ready_endpoint(&mut host);
        let mut link = host.connect(endpoint);
        host.send(&mut link, Message::bare("PROBE"));

        let mut replies = vec![host.recv(), host.recv()];
        replies.sort_by(|a, b| a.command.cmp(&b.command));
        assert_eq!(replies[0], Message::new("HERE", vec![Value::Bool(true)]));
        assert_eq!(replies[1], Message::new("THERE", vec![Value::Bool(false)]));

        host.send(&mut link, Message::bare(QUIT));
        assert_eq!(host.recv().command, STOPPED);
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn request_quit_from_another_thread_ends_loop() {
        let mut host = FakeHost::new();
        let runtime = ChildRuntime::new().on("LATER", |session: &mut ChildSession, _: &Message| {
            let handle = session.handle();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                handle.request_quit();
            });
            Ok(())
        });
        let worker = spawn_worker(runtime, host.endpoint);

        let endpoint = ready_endpoint(&mut host);
        let mut link = host.connect(endpoint);
        host.send(&mut link, Message::bare("LATER"));
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn invalid_command_is_rejected_before_sending() {
        let mut host = FakeHost::new();
        let runtime = ChildRuntime::new().on("BAD", |session: &mut ChildSession, _: &Message| {
            let rejected = session.send("has space", Vec::new()).is_err();
            Ok(session.send("CHECKED", vec![Value::Bool(rejected)])?)
        });
        let worker = spawn_worker(runtime, host.endpoint);

        let endpoint = ready_endpoint(&mut host);
        let mut link = host.connect(endpoint);
        host.send(&mut link, Message::bare("BAD"));
        assert_eq!(host.recv(), Message::new("CHECKED", vec![Value::Bool(true)]));

        host.send(&mut link, Message::bare(QUIT));
        assert_eq!(host.recv().command, STOPPED);
        worker.join().unwrap().unwrap();
    }
}
