//! Blocking peers for a running worker: a request client for the main
//! endpoint and a subscriber for the heartbeat endpoint.

use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::auth::channel::{Opener, Sealer};
use crate::auth::{handshake, AuthError, Keypair, PublicKey};
use crate::transport::tcp::HANDSHAKE_TIMEOUT_MS;
use crate::wire::codec::{CodecError, HeartbeatFrame, MessageParts, WireCodec};

#[derive(Debug)]
pub enum ClientError {
    Connect(io::Error),
    Codec(CodecError),
    Auth(AuthError),
    Timeout,
    Closed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(source) => write!(f, "failed to connect: {source}"),
            Self::Codec(source) => write!(f, "wire error: {source}"),
            Self::Auth(source) => write!(f, "secure channel error: {source}"),
            Self::Timeout => write!(f, "timed out waiting for a frame"),
            Self::Closed => write!(f, "connection closed by worker"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<CodecError> for ClientError {
    fn from(value: CodecError) -> Self {
        if value.is_disconnect() {
            return Self::Closed;
        }
        match value {
            CodecError::Io(source)
                if matches!(
                    source.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Self::Timeout
            }
            other => Self::Codec(other),
        }
    }
}

impl From<AuthError> for ClientError {
    fn from(value: AuthError) -> Self {
        Self::Auth(value)
    }
}

/// Client key material plus the worker key it expects to talk to.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub keypair: Keypair,
    pub server_public: PublicKey,
}

struct SecureChannel {
    sealer: Sealer,
    opener: Opener,
}

pub struct RequestClient {
    stream: TcpStream,
    codec: WireCodec,
    channel: Option<SecureChannel>,
}

impl RequestClient {
    pub fn connect(
        addr: impl ToSocketAddrs,
        credentials: Option<Credentials>,
        codec: WireCodec,
    ) -> Result<Self, ClientError> {
        let mut stream = TcpStream::connect(addr).map_err(ClientError::Connect)?;
        stream.set_nodelay(true).map_err(ClientError::Connect)?;

        let channel = match credentials {
            Some(credentials) => {
                stream
                    .set_read_timeout(Some(Duration::from_millis(HANDSHAKE_TIMEOUT_MS)))
                    .map_err(ClientError::Connect)?;
                let (sealer, opener) = handshake::connect(
                    &mut stream,
                    &codec,
                    &credentials.keypair,
                    &credentials.server_public,
                )?;
                Some(SecureChannel { sealer, opener })
            }
            None => None,
        };

        Ok(Self {
            stream,
            codec,
            channel,
        })
    }

    pub fn send(&mut self, command: &str, id: u32, data: &[u8]) -> Result<(), ClientError> {
        let body = self.codec.encode_message(command, id, data)?;
        let body = match self.channel.as_mut() {
            Some(channel) => channel.sealer.seal(&body)?,
            None => body,
        };
        self.codec.write_frame(&mut self.stream, &body)?;
        Ok(())
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<MessageParts, ClientError> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(ClientError::Connect)?;

        let body = self.codec.read_frame(&mut self.stream)?;
        let body = match self.channel.as_mut() {
            Some(channel) => channel.opener.open(&body)?,
            None => body,
        };
        Ok(self.codec.decode_message(&body)?)
    }

    /// Sends one request and waits for the reply carrying the same id.
    pub fn request(
        &mut self,
        command: &str,
        id: u32,
        data: &[u8],
        timeout: Duration,
    ) -> Result<MessageParts, ClientError> {
        self.send(command, id, data)?;
        loop {
            let reply = self.recv_timeout(timeout)?;
            if reply.id == id {
                return Ok(reply);
            }
        }
    }

    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

pub struct HeartbeatSubscriber {
    stream: TcpStream,
    codec: WireCodec,
}

impl HeartbeatSubscriber {
    pub fn connect(addr: impl ToSocketAddrs, codec: WireCodec) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).map_err(ClientError::Connect)?;
        Ok(Self { stream, codec })
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<HeartbeatFrame, ClientError> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(ClientError::Connect)?;
        let body = self.codec.read_frame(&mut self.stream)?;
        Ok(self.codec.decode_heartbeat(&body)?)
    }
}
