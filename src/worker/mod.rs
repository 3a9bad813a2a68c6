//! Request worker: owns the main endpoint, the optional heartbeat endpoint
//! and the command table, and runs the event loop on its own thread.

mod event_loop;
mod sender;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::bounded;
use serde_json::json;

use crate::auth::{AuthError, AuthIdentity};
use crate::config::AppConfig;
use crate::heartbeat::{self, HeartbeatError, HeartbeatPublisher};
use crate::logging::{LogLevel, Logger};
use crate::message::{IncomingMessage, OutgoingMessage};
use crate::transport::{EndpointSettings, TcpTransportFactory, TransportError, TransportFactory};
use crate::wire::codec::{CodecError, WireCodec};

use event_loop::{EventLoop, LoopSetup};

pub use event_loop::RECONNECT_BACKOFF;
pub use sender::{QueueSendCallback, SendWorker};

pub type CommandHandler = Arc<dyn Fn(&IncomingMessage, QueueSendCallback) + Send + Sync>;
pub type CommandMap = HashMap<String, CommandHandler>;

const LOG_CONTEXT: &str = "worker";
const THREAD_NAME: &str = "obelisk-request-worker";

#[derive(Debug)]
pub enum WorkerError {
    Auth(AuthError),
    Heartbeat(HeartbeatError),
    Codec(CodecError),
    Bind(TransportError),
    AlreadyRunning,
    Spawn(io::Error),
    JoinFailed,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth(source) => write!(f, "invalid authentication setup: {source}"),
            Self::Heartbeat(source) => write!(f, "invalid heartbeat setup: {source}"),
            Self::Codec(source) => write!(f, "invalid wire setup: {source}"),
            Self::Bind(source) => write!(f, "endpoint setup failed: {source}"),
            Self::AlreadyRunning => write!(f, "request worker is already running"),
            Self::Spawn(source) => write!(f, "failed to spawn event loop thread: {source}"),
            Self::JoinFailed => write!(f, "event loop thread join failed"),
        }
    }
}

impl std::error::Error for WorkerError {}

#[derive(Clone, Debug)]
pub struct HeartbeatSettings {
    pub address: String,
    pub interval: Duration,
}

/// Validated runtime settings consumed by [`RequestWorker::start`].
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub bind_address: String,
    pub heartbeat: Option<HeartbeatSettings>,
    pub auth: Option<Arc<AuthIdentity>>,
    pub codec: WireCodec,
    pub log_requests: bool,
}

impl WorkerConfig {
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            heartbeat: None,
            auth: None,
            codec: WireCodec::default(),
            log_requests: false,
        }
    }

    pub fn with_heartbeat(mut self, address: impl Into<String>, interval: Duration) -> Self {
        self.heartbeat = Some(HeartbeatSettings {
            address: address.into(),
            interval,
        });
        self
    }

    pub fn with_auth(mut self, identity: AuthIdentity) -> Self {
        self.auth = Some(Arc::new(identity));
        self
    }

    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, WorkerError> {
        let codec = WireCodec::from_app_config(app_config).map_err(WorkerError::Codec)?;
        let auth = AuthIdentity::from_config(&app_config.auth)
            .map_err(WorkerError::Auth)?
            .map(Arc::new);

        let heartbeat = if app_config.heartbeat.enabled {
            let interval = heartbeat::validate_interval(app_config.heartbeat.interval_ms)
                .map_err(WorkerError::Heartbeat)?;
            Some(HeartbeatSettings {
                address: format!("{}:{}", app_config.heartbeat.host, app_config.heartbeat.port),
                interval,
            })
        } else {
            None
        };

        Ok(Self {
            bind_address: format!("{}:{}", app_config.server.host, app_config.server.port),
            heartbeat,
            auth,
            codec,
            log_requests: app_config.worker.log_requests,
        })
    }
}

pub struct RequestWorker {
    logger: Arc<Logger>,
    factory: Arc<dyn TransportFactory>,
    commands: CommandMap,
    sender: SendWorker,
    stop_signal: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    heartbeat_addr: Option<SocketAddr>,
}

impl RequestWorker {
    pub fn new(logger: Arc<Logger>) -> Self {
        let factory = Arc::new(TcpTransportFactory::new(Arc::clone(&logger)));
        Self::with_factory(logger, factory)
    }

    pub fn with_factory(logger: Arc<Logger>, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            logger,
            factory,
            commands: HashMap::new(),
            sender: SendWorker::new(),
            stop_signal: Arc::new(AtomicBool::new(false)),
            thread: None,
            local_addr: None,
            heartbeat_addr: None,
        }
    }

    /// Registers `handler` for `command`, replacing any earlier registration.
    /// The table is frozen while the loop runs.
    pub fn attach<F>(&mut self, command: impl Into<String>, handler: F) -> Result<(), WorkerError>
    where
        F: Fn(&IncomingMessage, QueueSendCallback) + Send + Sync + 'static,
    {
        if self.is_running() {
            return Err(WorkerError::AlreadyRunning);
        }

        let command = command.into();
        if self.commands.insert(command.clone(), Arc::new(handler)).is_some() {
            self.logger.debug(
                Some(LOG_CONTEXT),
                &format!("replaced handler for command '{command}'"),
            );
        }
        Ok(())
    }

    pub fn start(&mut self, config: &WorkerConfig) -> Result<(), WorkerError> {
        if self.is_running() {
            return Err(WorkerError::AlreadyRunning);
        }

        let settings = EndpointSettings {
            address: config.bind_address.clone(),
            codec: config.codec,
            auth: config.auth.clone(),
        };
        let transport = self.factory.bind_main(&settings).map_err(WorkerError::Bind)?;
        let local_addr = transport.local_addr();

        let heartbeat = match &config.heartbeat {
            Some(heartbeat) => {
                let broadcaster = self
                    .factory
                    .bind_heartbeat(&heartbeat.address, config.codec)
                    .map_err(WorkerError::Bind)?;
                Some(
                    HeartbeatPublisher::new(broadcaster, config.codec, heartbeat.interval)
                        .map_err(WorkerError::Heartbeat)?,
                )
            }
            None => None,
        };
        let heartbeat_addr = heartbeat.as_ref().and_then(HeartbeatPublisher::local_addr);

        if let Some(identity) = &config.auth {
            if identity.authenticator().allows_any() {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    "authentication enabled with an empty allowlist; any client completing the handshake is accepted",
                );
            }
        }

        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "request worker starting",
            Some(json!({
                "address": local_addr.map_or(settings.address, |addr| addr.to_string()),
                "heartbeat": heartbeat.as_ref().map(HeartbeatPublisher::initial_metadata_payload),
                "secure": config.auth.as_ref().map(|identity| json!({
                    "public_key": identity.public_key().to_hex(),
                    "authorized_clients": identity.authenticator().authorized_count()
                })),
                "commands": self.commands.keys().cloned().collect::<Vec<_>>(),
                "log_requests": config.log_requests
            })),
        );

        let (wakeup_tx, wakeup_rx) = bounded(1);
        self.sender.install_wakeup(Some(wakeup_tx));
        self.stop_signal.store(false, Ordering::SeqCst);

        let event_loop = EventLoop::new(LoopSetup {
            logger: Arc::clone(&self.logger),
            transport,
            heartbeat,
            sender: self.sender.clone(),
            wakeup: wakeup_rx,
            commands: Arc::new(self.commands.clone()),
            stop_signal: Arc::clone(&self.stop_signal),
            log_requests: config.log_requests,
        });

        let spawned = thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || event_loop.run());
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.local_addr = local_addr;
                self.heartbeat_addr = heartbeat_addr;
                Ok(())
            }
            Err(source) => {
                self.sender.install_wakeup(None);
                Err(WorkerError::Spawn(source))
            }
        }
    }

    /// Unblocks the loop, waits for it to exit and closes its endpoints. Idempotent.
    pub fn stop(&mut self) -> Result<(), WorkerError> {
        self.stop_signal.store(true, Ordering::SeqCst);
        self.sender.wake();

        let joined = match self.thread.take() {
            Some(handle) => {
                let result = handle.join().map_err(|_| WorkerError::JoinFailed);
                self.logger.info(Some(LOG_CONTEXT), "request worker stopped");
                result
            }
            None => Ok(()),
        };

        self.sender.install_wakeup(None);
        self.local_addr = None;
        self.heartbeat_addr = None;
        joined
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    pub fn queue_send(&self, message: OutgoingMessage) {
        self.sender.queue_send(message);
    }

    /// Producer handle for threads that outlive a single request.
    pub fn sender(&self) -> SendWorker {
        self.sender.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn heartbeat_addr(&self) -> Option<SocketAddr> {
        self.heartbeat_addr
    }
}

impl Drop for RequestWorker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
