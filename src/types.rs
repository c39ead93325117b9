//! Core types for CryptoTCP: identifiers, message types and the error enum.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Connection identifier handed out by the server's id pool.
pub type ConnId = u32;

/// Byte that terminates every frame on the wire.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Prefix the server prepends when echoing a message addressed to itself.
pub const ECHO_PREFIX: &str = "the server receives your message: ";

/// Message type carried in the `msgType` field of every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum MsgType {
    HandshakeRequest,
    HandshakeAccept,
    HandshakeReject,
    EncryptedAsymmetric,
    EncryptedSymmetric,
    /// Any code this implementation does not know about.
    Unknown(i32),
}

impl MsgType {
    /// Numeric wire code.
    pub fn code(self) -> i32 {
        match self {
            MsgType::HandshakeRequest => 1,
            MsgType::HandshakeAccept => 2,
            MsgType::HandshakeReject => 3,
            MsgType::EncryptedAsymmetric => 4,
            MsgType::EncryptedSymmetric => 5,
            MsgType::Unknown(code) => code,
        }
    }

    /// Whether the body must be decrypted before use. Every code from 4 up
    /// counts; codes without a cipher are rejected later by the connection.
    pub fn is_crypto_payload(self) -> bool {
        self.code() >= MsgType::EncryptedAsymmetric.code()
    }
}

impl From<i32> for MsgType {
    fn from(code: i32) -> Self {
        match code {
            1 => MsgType::HandshakeRequest,
            2 => MsgType::HandshakeAccept,
            3 => MsgType::HandshakeReject,
            4 => MsgType::EncryptedAsymmetric,
            5 => MsgType::EncryptedSymmetric,
            other => MsgType::Unknown(other),
        }
    }
}

impl From<MsgType> for i32 {
    fn from(t: MsgType) -> Self {
        t.code()
    }
}

/// Errors that can occur in CryptoTCP
#[derive(Debug, Error)]
pub enum CryptoTcpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Message type {0:?} cannot be used for encryption")]
    InvalidMessageType(MsgType),
    #[error("Handshake failed: connection closed before a reply arrived")]
    HandshakeFailed,
    #[error("Handshake rejected by peer: {0}")]
    HandshakeRejected(String),
    #[error("Unexpected message type during handshake: {0:?}")]
    UnexpectedMessageType(MsgType),
    #[error("Connection is already encrypted")]
    AlreadyCrypto,
    #[error("No connection id available")]
    PoolExhausted,
    #[error("Connection {0} does not exist")]
    CidNotExist(ConnId),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

impl From<rsa::Error> for CryptoTcpError {
    fn from(e: rsa::Error) -> Self {
        CryptoTcpError::Crypto(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CryptoTcpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_type_codes() {
        for code in 1..=5 {
            assert_eq!(MsgType::from(code).code(), code);
        }
        assert_eq!(MsgType::from(42), MsgType::Unknown(42));
        assert_eq!(i32::from(MsgType::EncryptedSymmetric), 5);
    }

    #[test]
    fn test_crypto_payload_types() {
        assert!(MsgType::EncryptedAsymmetric.is_crypto_payload());
        assert!(MsgType::EncryptedSymmetric.is_crypto_payload());
        assert!(!MsgType::HandshakeRequest.is_crypto_payload());
        assert!(!MsgType::HandshakeReject.is_crypto_payload());
        assert!(MsgType::Unknown(9).is_crypto_payload());
        assert!(!MsgType::Unknown(0).is_crypto_payload());
    }
}
