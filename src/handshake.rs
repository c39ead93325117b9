//! Session key negotiation.
//!
//! The client (initiator) sends its RSA public key in a `HandshakeRequest`.
//! The server (responder) picks a session key, seals it with that public key
//! and answers with `HandshakeAccept`, carrying its own public key and the
//! id it assigned to the connection. Only the sealed key ever crosses the
//! wire.
//!
//! ```text
//! client                                   server
//!   | -- HandshakeRequest{RSAPubKey} ------> |
//!   | <-- HandshakeAccept{to, RSAPubKey,     |
//!   |                     AESKey} ---------- |   or HandshakeReject{body}
//! ```
//!
//! The initiator waits for the reply without a timeout; a peer that never
//! answers and never closes leaves it waiting.

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conn::CryptoConn;
use crate::crypto::{parse_public_key, rsa_encrypt, KeyPair, SessionKey};
use crate::envelope::Envelope;
use crate::types::{ConnId, CryptoTcpError, MsgType, Result};

/// Initiator progress, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotCrypto,
    AwaitingResponse,
    Established,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCrypto => write!(f, "NotCrypto"),
            Self::AwaitingResponse => write!(f, "AwaitingResponse"),
            Self::Established => write!(f, "Established"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Generate an RSA keypair on the blocking pool.
pub async fn generate_keypair(bits: usize) -> Result<KeyPair> {
    tokio::task::spawn_blocking(move || KeyPair::generate(bits))
        .await
        .map_err(|e| CryptoTcpError::Crypto(format!("key generation task failed: {}", e)))?
}

/// Run the client side of the handshake. On success the connection is
/// encrypted and the id assigned by the server is returned.
pub async fn initiate(conn: &CryptoConn, config: &Config) -> Result<ConnId> {
    if conn.is_crypto() {
        return Err(CryptoTcpError::AlreadyCrypto);
    }
    debug!("Handshake state: {}", HandshakeState::NotCrypto);

    let keys = Arc::new(generate_keypair(config.rsa_bits).await?);
    let request = Envelope::new(MsgType::HandshakeRequest, 0, config.server_id)
        .with_public_key(keys.public_key_der()?);
    conn.write_message(&request).await?;
    debug!("Handshake state: {}", HandshakeState::AwaitingResponse);

    let result = match await_reply(conn).await {
        Some(reply) => accept_reply(conn, keys, reply),
        None => Err(CryptoTcpError::HandshakeFailed),
    };

    match &result {
        Ok(id) => {
            debug!("Handshake state: {}", HandshakeState::Established);
            info!("Connection encrypted, assigned id {}", id);
        }
        Err(e) => warn!("Handshake state: {} ({})", HandshakeState::Failed, e),
    }
    result
}

/// Wait for the first decodable reply. A reader task reports either the
/// reply or the end of the stream; whichever arrives settles the handshake.
async fn await_reply(conn: &CryptoConn) -> Option<Envelope> {
    let (closed_tx, closed_rx) = oneshot::channel::<()>();
    let (reply_tx, reply_rx) = oneshot::channel::<Envelope>();

    let reader = conn.clone();
    tokio::spawn(async move {
        loop {
            match reader.read_message().await {
                Ok(msg) => {
                    let _ = reply_tx.send(msg);
                    return;
                }
                Err(CryptoTcpError::Decode(e)) => debug!("Discarding malformed frame: {}", e),
                Err(_) => {
                    let _ = closed_tx.send(());
                    return;
                }
            }
        }
    });

    tokio::select! {
        Ok(reply) = reply_rx => Some(reply),
        Ok(()) = closed_rx => None,
        else => None,
    }
}

fn accept_reply(conn: &CryptoConn, keys: Arc<KeyPair>, reply: Envelope) -> Result<ConnId> {
    match reply.msg_type {
        MsgType::HandshakeAccept => {
            let remote_key = parse_public_key(&reply.public_key)?;
            let session_key = SessionKey::from_bytes(keys.decrypt(&reply.session_key)?)?;
            conn.establish(reply.to, keys, remote_key, session_key)?;
            Ok(reply.to)
        }
        MsgType::HandshakeReject => Err(CryptoTcpError::HandshakeRejected(reply.body_str())),
        other => Err(CryptoTcpError::UnexpectedMessageType(other)),
    }
}

/// Answer a `HandshakeRequest` that arrived on `conn`. The connection state
/// is only committed once the accept has been written.
pub async fn respond(
    conn: &CryptoConn,
    server_keys: &Arc<KeyPair>,
    request: &Envelope,
    config: &Config,
) -> Result<()> {
    let id = conn.id().ok_or(CryptoTcpError::ConnectionClosed)?;

    if conn.is_crypto() {
        reject(conn, id, "already crypto").await?;
        return Err(CryptoTcpError::AlreadyCrypto);
    }

    let remote_key = match parse_public_key(&request.public_key) {
        Ok(key) => key,
        Err(e) => {
            reject(conn, id, "wrong rsaPubKey").await?;
            return Err(e);
        }
    };

    let session_key = SessionKey::generate(config.session_key_len);
    let sealed = rsa_encrypt(&remote_key, session_key.as_bytes())?;
    let accept = Envelope::new(MsgType::HandshakeAccept, config.server_id, id)
        .with_public_key(server_keys.public_key_der()?)
        .with_session_key(sealed);
    conn.write_message(&accept).await?;

    conn.establish(id, server_keys.clone(), remote_key, session_key)?;
    info!("Connection {} encrypted", id);
    Ok(())
}

async fn reject(conn: &CryptoConn, id: ConnId, reason: &str) -> Result<()> {
    warn!("Rejecting handshake from {}: {}", id, reason);
    let msg = Envelope::new(MsgType::HandshakeReject, 0, id).with_body(reason);
    conn.write_message(&msg).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    fn test_config() -> Config {
        Config { rsa_bits: 1024, ..Config::default() }
    }

    async fn pair(config: &Config) -> (CryptoConn, CryptoConn) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            CryptoConn::new(dialed.unwrap(), config),
            CryptoConn::new(accepted.unwrap().0, config),
        )
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let config = test_config();
        let (client, server) = pair(&config).await;
        server.set_id(1042);
        let server_keys = Arc::new(generate_keypair(config.rsa_bits).await.unwrap());

        let responder = {
            let server = server.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let request = server.read_message().await.unwrap();
                assert_eq!(request.msg_type, MsgType::HandshakeRequest);
                assert_eq!(request.to, config.server_id);
                respond(&server, &server_keys, &request, &config).await
            })
        };

        let id = initiate(&client, &config).await.unwrap();
        responder.await.unwrap().unwrap();

        assert_eq!(id, 1042);
        assert_eq!(client.id(), Some(1042));
        assert!(client.is_crypto());
        assert!(server.is_crypto());
        let key = client.session_key().unwrap();
        assert_eq!(Some(key.clone()), server.session_key());
        let sealed = key.encrypt(b"round trip").unwrap();
        assert_eq!(server.session_key().unwrap().decrypt(&sealed).unwrap(), b"round trip");

        assert!(matches!(initiate(&client, &config).await, Err(CryptoTcpError::AlreadyCrypto)));
    }

    #[tokio::test]
    async fn test_malformed_key_rejected() {
        let config = test_config();
        let (client, server) = pair(&config).await;
        server.set_id(1001);
        let server_keys = Arc::new(generate_keypair(config.rsa_bits).await.unwrap());

        let request = Envelope::new(MsgType::HandshakeRequest, 0, config.server_id)
            .with_public_key(b"not a key".to_vec());
        assert!(respond(&server, &server_keys, &request, &config).await.is_err());
        assert!(!server.is_crypto());

        let reply = client.read_message().await.unwrap();
        assert_eq!(reply.msg_type, MsgType::HandshakeReject);
        assert_eq!(reply.body_str(), "wrong rsaPubKey");
    }

    #[tokio::test]
    async fn test_initiator_sees_reject() {
        let config = test_config();
        let (client, server) = pair(&config).await;
        tokio::spawn(async move {
            let _ = server.read_message().await;
            let reject = Envelope::new(MsgType::HandshakeReject, 0, 0).with_body("go away");
            server.write_message(&reject).await.unwrap();
        });

        match initiate(&client, &config).await {
            Err(CryptoTcpError::HandshakeRejected(reason)) => assert_eq!(reason, "go away"),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(!client.is_crypto());
    }

    #[tokio::test]
    async fn test_initiator_unexpected_type() {
        let config = test_config();
        let (client, server) = pair(&config).await;
        tokio::spawn(async move {
            let _ = server.read_message().await;
            server.write_frame(bytes::Bytes::from_static(b"{{{")).await.unwrap();
            let msg = Envelope::new(MsgType::EncryptedSymmetric, 0, 0);
            server.write_message(&msg).await.unwrap();
        });

        assert!(matches!(
            initiate(&client, &config).await,
            Err(CryptoTcpError::UnexpectedMessageType(MsgType::EncryptedSymmetric))
        ));
        assert!(!client.is_crypto());
    }

    #[tokio::test]
    async fn test_initiator_peer_closes() {
        let config = test_config();
        let (client, server) = pair(&config).await;
        tokio::spawn(async move {
            let _ = server.read_message().await;
            server.close().await;
        });

        assert!(matches!(initiate(&client, &config).await, Err(CryptoTcpError::HandshakeFailed)));
        assert!(!client.is_crypto());
    }
}
