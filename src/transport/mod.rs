//! Network endpoints the request worker drives.
//!
//! The event loop only ever sees these traits; `tcp` provides the real
//! sockets and tests substitute an in-memory network.

pub mod tcp;

#[cfg(test)]
pub(crate) mod memory;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::auth::{AuthError, AuthIdentity};
use crate::message::{Identity, IncomingMessage, OutgoingMessage};
use crate::wire::codec::{CodecError, WireCodec};

pub use tcp::TcpTransportFactory;

#[derive(Debug)]
pub enum TransportError {
    Bind {
        address: String,
        source: io::Error,
    },
    Configure {
        source: io::Error,
    },
    Accept {
        source: io::Error,
    },
    Peer {
        identity: Identity,
        source: CodecError,
    },
    Codec(CodecError),
    Auth(AuthError),
    Closed,
}

impl TransportError {
    /// Fatal errors mean the endpoint itself is unusable and must be recreated.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Accept { .. } | Self::Closed)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind endpoint on {address}: {source}")
            }
            Self::Configure { source } => write!(f, "failed to configure endpoint socket: {source}"),
            Self::Accept { source } => write!(f, "endpoint stopped accepting connections: {source}"),
            Self::Peer { identity, source } => {
                write!(f, "transmission to peer {identity} failed: {source}")
            }
            Self::Codec(source) => write!(f, "wire codec error: {source}"),
            Self::Auth(source) => write!(f, "channel security error: {source}"),
            Self::Closed => write!(f, "endpoint is closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<CodecError> for TransportError {
    fn from(value: CodecError) -> Self {
        Self::Codec(value)
    }
}

impl From<AuthError> for TransportError {
    fn from(value: AuthError) -> Self {
        Self::Auth(value)
    }
}

#[derive(Debug)]
pub enum InboundEvent {
    Request(IncomingMessage),
    Fatal(TransportError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// No connected peer carries the destination identity; the message is dropped.
    Unroutable,
}

#[derive(Clone, Debug)]
pub struct EndpointSettings {
    pub address: String,
    pub codec: WireCodec,
    pub auth: Option<Arc<AuthIdentity>>,
}

/// Main request endpoint: inbound requests arrive on a channel, replies go out through `send`.
pub trait Transport: Send {
    fn inbound(&self) -> &Receiver<InboundEvent>;

    /// A failure to reach one peer is reported as a non-fatal error. Fatal
    /// errors mean the endpoint itself is gone.
    fn send(&mut self, message: &OutgoingMessage) -> Result<Delivery, TransportError>;

    /// Rebinds the listening socket on the address it already holds.
    /// Established peers, their routing identities and the inbound channel
    /// survive, so messages addressed to them are still deliverable.
    fn reopen(&mut self) -> Result<(), TransportError>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn shutdown(&mut self);
}

/// Fan-out endpoint used for heartbeats. Returns the number of subscribers reached.
pub trait Broadcaster: Send {
    fn publish(&mut self, body: &[u8]) -> Result<usize, TransportError>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn shutdown(&mut self);
}

pub trait TransportFactory: Send + Sync {
    fn bind_main(&self, settings: &EndpointSettings) -> Result<Box<dyn Transport>, TransportError>;

    fn bind_heartbeat(
        &self,
        address: &str,
        codec: WireCodec,
    ) -> Result<Box<dyn Broadcaster>, TransportError>;
}
