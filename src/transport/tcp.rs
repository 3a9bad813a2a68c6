use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::json;

use crate::auth::channel::{Opener, Sealer};
use crate::auth::{handshake, AuthIdentity};
use crate::logging::{LogLevel, Logger};
use crate::message::{Identity, IncomingMessage, OutgoingMessage};
use crate::wire::codec::WireCodec;

use super::{
    Broadcaster, Delivery, EndpointSettings, InboundEvent, Transport, TransportError,
    TransportFactory,
};

pub const ACCEPT_POLL_INTERVAL_MS: u64 = 20;
pub const HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
pub const WRITE_TIMEOUT_MS: u64 = 5_000;

const LOG_CONTEXT: &str = "transport::tcp";

struct PeerWriter {
    stream: TcpStream,
    sealer: Option<Sealer>,
}

struct PeerConnection {
    peer_addr: SocketAddr,
    writer: Mutex<PeerWriter>,
}

impl PeerConnection {
    fn shutdown(&self) {
        let _ = self
            .writer
            .lock()
            .expect("peer writer lock poisoned")
            .stream
            .shutdown(Shutdown::Both);
    }
}

type PeerMap = Arc<Mutex<HashMap<Identity, Arc<PeerConnection>>>>;

#[derive(Clone)]
struct PeerContext {
    codec: WireCodec,
    auth: Option<Arc<AuthIdentity>>,
    peers: PeerMap,
    inbound: Sender<InboundEvent>,
    logger: Arc<Logger>,
}

struct Acceptor {
    stop_signal: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Acceptor {
    fn spawn(listener: TcpListener, context: PeerContext) -> Result<Self, TransportError> {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let acceptor_stop = Arc::clone(&stop_signal);
        let handle = thread::Builder::new()
            .name("obelisk-acceptor".to_owned())
            .spawn(move || run_acceptor(listener, context, acceptor_stop))
            .map_err(|source| TransportError::Configure { source })?;
        Ok(Self {
            stop_signal,
            handle,
        })
    }

    fn stop(self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

/// Identity-routed request endpoint. Every accepted connection gets a random
/// identity; replies addressed to an identity go back down that connection.
///
/// The listener and the established peers are independent: `reopen` rebinds
/// the listener on the same address while existing routes keep working.
pub struct TcpRouter {
    local_addr: SocketAddr,
    context: PeerContext,
    inbound: Receiver<InboundEvent>,
    acceptor: Option<Acceptor>,
    closed: bool,
}

fn bind_listener(address: &str) -> Result<(TcpListener, SocketAddr), TransportError> {
    let listener = TcpListener::bind(address).map_err(|source| TransportError::Bind {
        address: address.to_owned(),
        source,
    })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| TransportError::Configure { source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| TransportError::Configure { source })?;
    Ok((listener, local_addr))
}

impl TcpRouter {
    pub fn bind(settings: &EndpointSettings, logger: Arc<Logger>) -> Result<Self, TransportError> {
        let (listener, local_addr) = bind_listener(&settings.address)?;

        let (inbound_tx, inbound_rx) = unbounded();
        let context = PeerContext {
            codec: settings.codec,
            auth: settings.auth.clone(),
            peers: Arc::new(Mutex::new(HashMap::new())),
            inbound: inbound_tx,
            logger,
        };
        let acceptor = Acceptor::spawn(listener, context.clone())?;

        Ok(Self {
            local_addr,
            context,
            inbound: inbound_rx,
            acceptor: Some(acceptor),
            closed: false,
        })
    }

    pub fn peer_count(&self) -> usize {
        self.context.peers.lock().expect("peer map lock poisoned").len()
    }

    /// Handle for pushing events into this router's inbound channel.
    #[cfg(test)]
    pub(crate) fn inbound_sender(&self) -> Sender<InboundEvent> {
        self.context.inbound.clone()
    }
}

impl Transport for TcpRouter {
    fn inbound(&self) -> &Receiver<InboundEvent> {
        &self.inbound
    }

    fn send(&mut self, message: &OutgoingMessage) -> Result<Delivery, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let connection = self
            .context
            .peers
            .lock()
            .expect("peer map lock poisoned")
            .get(&message.destination)
            .cloned();
        let Some(connection) = connection else {
            return Ok(Delivery::Unroutable);
        };

        let codec = self.context.codec;
        let body = codec.encode_message(&message.command, message.id, &message.payload)?;

        let written = {
            let mut writer = connection.writer.lock().expect("peer writer lock poisoned");
            let body = match writer.sealer.as_mut() {
                Some(sealer) => sealer.seal(&body)?,
                None => body,
            };
            codec.write_frame(&mut writer.stream, &body)
        };

        match written {
            Ok(()) => Ok(Delivery::Sent),
            Err(source) => {
                // The peer's reader thread notices the shutdown and exits.
                self.context
                    .peers
                    .lock()
                    .expect("peer map lock poisoned")
                    .remove(&message.destination);
                connection.shutdown();
                self.context.logger.debug(
                    Some(LOG_CONTEXT),
                    &format!(
                        "dropped peer {} at {} after failed write",
                        message.destination, connection.peer_addr
                    ),
                );
                Err(TransportError::Peer {
                    identity: message.destination.clone(),
                    source,
                })
            }
        }
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.stop();
        }

        let (listener, _) = bind_listener(&self.local_addr.to_string())?;
        self.acceptor = Some(Acceptor::spawn(listener, self.context.clone())?);
        self.context.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "listener rebound",
            Some(json!({
                "address": self.local_addr.to_string(),
                "peers": self.peer_count()
            })),
        );
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn shutdown(&mut self) {
        self.closed = true;
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.stop();
        }

        let mut peers = self.context.peers.lock().expect("peer map lock poisoned");
        for connection in peers.values() {
            connection.shutdown();
        }
        peers.clear();
    }
}

impl Drop for TcpRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_acceptor(listener: TcpListener, context: PeerContext, stop_signal: Arc<AtomicBool>) {
    let next_peer_seq = AtomicU64::new(1);

    while !stop_signal.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let seq = next_peer_seq.fetch_add(1, Ordering::Relaxed);
                let peer_context = context.clone();
                let spawned = thread::Builder::new()
                    .name(format!("obelisk-peer-{seq}"))
                    .spawn(move || serve_peer(stream, peer_addr, peer_context));
                if let Err(error) = spawned {
                    context.logger.warn(
                        Some(LOG_CONTEXT),
                        &format!("failed to spawn reader for {peer_addr}: {error}"),
                    );
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(ACCEPT_POLL_INTERVAL_MS));
            }
            Err(error) if is_transient_accept_error(&error) => {
                context.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("transient accept error: {error}"),
                );
            }
            Err(source) => {
                let _ = context
                    .inbound
                    .send(InboundEvent::Fatal(TransportError::Accept { source }));
                return;
            }
        }
    }
}

fn is_transient_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
    )
}

fn configure_peer_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)))
}

fn secure_peer_stream(
    stream: &mut TcpStream,
    context: &PeerContext,
    identity: &AuthIdentity,
    peer_addr: SocketAddr,
) -> Option<(Sealer, Opener)> {
    let timeout = Some(Duration::from_millis(HANDSHAKE_TIMEOUT_MS));
    if stream.set_read_timeout(timeout).is_err() {
        return None;
    }

    match handshake::accept(stream, &context.codec, identity) {
        Ok((client_key, sealer, opener)) => {
            context.logger.debug(
                Some(LOG_CONTEXT),
                &format!("authenticated client key {client_key} from {peer_addr}"),
            );
            stream.set_read_timeout(None).ok()?;
            Some((sealer, opener))
        }
        Err(error) => {
            context.logger.warn(
                Some(LOG_CONTEXT),
                &format!("handshake with {peer_addr} failed: {error}; closing connection"),
            );
            None
        }
    }
}

fn serve_peer(mut stream: TcpStream, peer_addr: SocketAddr, context: PeerContext) {
    if let Err(error) = configure_peer_stream(&stream) {
        context.logger.warn(
            Some(LOG_CONTEXT),
            &format!("failed to configure connection from {peer_addr}: {error}"),
        );
        return;
    }

    let (sealer, mut opener) = match context.auth.as_deref() {
        Some(identity) => match secure_peer_stream(&mut stream, &context, identity, peer_addr) {
            Some((sealer, opener)) => (Some(sealer), Some(opener)),
            None => {
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
        },
        None => (None, None),
    };

    let writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(error) => {
            context.logger.warn(
                Some(LOG_CONTEXT),
                &format!("failed to clone stream for {peer_addr}: {error}"),
            );
            return;
        }
    };

    let identity = Identity::random();
    context
        .peers
        .lock()
        .expect("peer map lock poisoned")
        .insert(
            identity.clone(),
            Arc::new(PeerConnection {
                peer_addr,
                writer: Mutex::new(PeerWriter {
                    stream: writer,
                    sealer,
                }),
            }),
        );
    context.logger.log(
        LogLevel::Debug,
        Some(LOG_CONTEXT),
        "accepted peer connection",
        Some(json!({
            "identity": identity.to_string(),
            "peer_addr": peer_addr.to_string(),
            "secure": opener.is_some()
        })),
    );

    loop {
        let body = match context.codec.read_frame(&mut stream) {
            Ok(body) => body,
            Err(error) if error.is_disconnect() => break,
            Err(error) => {
                context.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("unreadable frame from peer {identity}: {error}; closing connection"),
                );
                break;
            }
        };

        let body = match opener.as_mut() {
            Some(opener) => match opener.open(&body) {
                Ok(plain) => plain,
                Err(error) => {
                    context.logger.warn(
                        Some(LOG_CONTEXT),
                        &format!("peer {identity}: {error}; closing connection"),
                    );
                    break;
                }
            },
            None => body,
        };

        match context.codec.decode_message(&body) {
            Ok(parts) => {
                let request = IncomingMessage {
                    origin: identity.clone(),
                    command: parts.command,
                    id: parts.id,
                    payload: parts.data,
                };
                if context.inbound.send(InboundEvent::Request(request)).is_err() {
                    break;
                }
            }
            Err(error) => {
                context.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("skipping undecodable request from peer {identity}: {error}"),
                );
            }
        }
    }

    context
        .peers
        .lock()
        .expect("peer map lock poisoned")
        .remove(&identity);
    let _ = stream.shutdown(Shutdown::Both);
}

struct Subscriber {
    peer_addr: SocketAddr,
    stream: TcpStream,
}

/// Heartbeat fan-out. Subscribers are picked up lazily on each publish.
pub struct TcpPublisher {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    codec: WireCodec,
    subscribers: Vec<Subscriber>,
    logger: Arc<Logger>,
}

impl TcpPublisher {
    pub fn bind(address: &str, codec: WireCodec, logger: Arc<Logger>) -> Result<Self, TransportError> {
        let (listener, local_addr) = bind_listener(address)?;

        Ok(Self {
            listener: Some(listener),
            local_addr,
            codec,
            subscribers: Vec::new(),
            logger,
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn accept_pending(&mut self) -> Result<(), TransportError> {
        let Some(listener) = self.listener.as_ref() else {
            return Err(TransportError::Closed);
        };

        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(error) = configure_peer_stream(&stream) {
                        self.logger.warn(
                            Some(LOG_CONTEXT),
                            &format!("failed to configure heartbeat subscriber {peer_addr}: {error}"),
                        );
                        continue;
                    }
                    self.subscribers.push(Subscriber { peer_addr, stream });
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) if is_transient_accept_error(&error) => continue,
                Err(source) => return Err(TransportError::Accept { source }),
            }
        }
    }
}

impl Broadcaster for TcpPublisher {
    fn publish(&mut self, body: &[u8]) -> Result<usize, TransportError> {
        self.accept_pending()?;

        let codec = self.codec;
        let logger = &self.logger;
        self.subscribers.retain_mut(|subscriber| {
            match codec.write_frame(&mut subscriber.stream, body) {
                Ok(()) => true,
                Err(error) => {
                    logger.debug(
                        Some(LOG_CONTEXT),
                        &format!(
                            "dropping heartbeat subscriber {}: {error}",
                            subscriber.peer_addr
                        ),
                    );
                    false
                }
            }
        });

        Ok(self.subscribers.len())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn shutdown(&mut self) {
        self.listener = None;
        for subscriber in self.subscribers.drain(..) {
            let _ = subscriber.stream.shutdown(Shutdown::Both);
        }
    }
}

pub struct TcpTransportFactory {
    logger: Arc<Logger>,
}

impl TcpTransportFactory {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }
}

impl TransportFactory for TcpTransportFactory {
    fn bind_main(&self, settings: &EndpointSettings) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(TcpRouter::bind(settings, Arc::clone(&self.logger))?))
    }

    fn bind_heartbeat(
        &self,
        address: &str,
        codec: WireCodec,
    ) -> Result<Box<dyn Broadcaster>, TransportError> {
        Ok(Box::new(TcpPublisher::bind(address, codec, Arc::clone(&self.logger))?))
    }
}
