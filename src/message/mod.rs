use std::fmt;

use uuid::Uuid;

/// Opaque routing token naming the peer a request came from.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Identity(Vec<u8>);

impl Identity {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn random() -> Self {
        Self::from(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Uuid> for Identity {
    fn from(value: Uuid) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingMessage {
    pub origin: Identity,
    pub command: String,
    pub id: u32,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub destination: Identity,
    pub command: String,
    pub id: u32,
    pub payload: Vec<u8>,
}

impl OutgoingMessage {
    pub fn new(
        destination: Identity,
        command: impl Into<String>,
        id: u32,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            destination,
            command: command.into(),
            id,
            payload: payload.into(),
        }
    }

    // Replies echo origin, command and id so the peer can correlate them.
    pub fn reply_to(request: &IncomingMessage, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            destination: request.origin.clone(),
            command: request.command.clone(),
            id: request.id,
            payload: payload.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{Identity, IncomingMessage, OutgoingMessage};

    #[test]
    fn reply_echoes_origin_command_and_id() {
        let request = IncomingMessage {
            origin: Identity::new(vec![0xab, 0xcd]),
            command: "fetch_history".to_owned(),
            id: 77,
            payload: b"addr".to_vec(),
        };

        let reply = OutgoingMessage::reply_to(&request, b"rows".to_vec());

        assert_eq!(reply.destination, request.origin);
        assert_eq!(reply.command, "fetch_history");
        assert_eq!(reply.id, 77);
        assert_eq!(reply.payload, b"rows");
    }

    #[test]
    fn identity_renders_as_hex() {
        let identity = Identity::new(vec![0x00, 0x0f, 0xff]);
        assert_eq!(identity.to_string(), "000fff");
    }

    #[test]
    fn identity_from_uuid_keeps_all_sixteen_bytes() {
        let uuid = Uuid::new_v4();
        let identity = Identity::from(uuid);

        assert_eq!(identity.as_bytes(), uuid.as_bytes());
        assert_ne!(Identity::random(), Identity::random());
    }
}
