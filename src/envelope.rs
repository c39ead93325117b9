//! The message envelope exchanged over a connection.
//!
//! Every frame carries one envelope serialized as a JSON object. Byte fields
//! travel as standard base64 strings and are left out entirely when empty:
//!
//! ```text
//! {"msgType":5,"from":1001,"to":1002,"body":"q83v..."}
//! ```
//!
//! | Field       | Meaning                                         |
//! |-------------|-------------------------------------------------|
//! | `msgType`   | [`MsgType`] code                                |
//! | `from`      | sender id (overwritten by the server on ingest) |
//! | `to`        | destination id                                  |
//! | `body`      | payload, ciphertext for crypto payload types    |
//! | `RSAPubKey` | PKCS#1 DER public key (handshake only)          |
//! | `AESKey`    | RSA-encrypted session key (accept only)         |
//! | `sign`      | reserved, never populated or checked            |

use serde::{Deserialize, Serialize};

use crate::types::{ConnId, MsgType, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    #[serde(rename = "msgType")]
    pub msg_type: MsgType,
    #[serde(deserialize_with = "claimed_id::deserialize")]
    pub from: ConnId,
    pub to: ConnId,
    #[serde(with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
    #[serde(rename = "RSAPubKey", with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub public_key: Vec<u8>,
    #[serde(rename = "AESKey", with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub session_key: Vec<u8>,
    #[serde(rename = "sign", with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<u8>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new(MsgType::Unknown(0), 0, 0)
    }
}

impl Envelope {
    pub fn new(msg_type: MsgType, from: ConnId, to: ConnId) -> Self {
        Self {
            msg_type,
            from,
            to,
            body: Vec::new(),
            public_key: Vec::new(),
            session_key: Vec::new(),
            signature: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_public_key(mut self, der: Vec<u8>) -> Self {
        self.public_key = der;
        self
    }

    pub fn with_session_key(mut self, sealed: Vec<u8>) -> Self {
        self.session_key = sealed;
        self
    }

    /// Serialize to the single-line JSON form. The result never contains the
    /// frame delimiter.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Body as text, lossily.
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

// The server overwrites `from` on ingest, so a claimed value that is not a
// valid id must not make the whole frame undecodable.
mod claimed_id {
    use serde::{Deserialize, Deserializer};

    use crate::types::ConnId;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ConnId, D::Error> {
        let claimed = Option::<serde_json::Number>::deserialize(deserializer)?;
        Ok(claimed
            .and_then(|n| n.as_u64())
            .and_then(|n| ConnId::try_from(n).ok())
            .unwrap_or_default())
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
