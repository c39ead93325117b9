use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::Config;
use crate::conn::CryptoConn;
use crate::envelope::Envelope;
use crate::handshake::initiate;
use crate::types::{ConnId, CryptoTcpError, MsgType, Result};

/// Client side of a CryptoTCP connection.
///
/// `connect` dials the server and completes the handshake before returning,
/// so every `CryptoClient` holds an encrypted connection and a server-assigned
/// id. Clones share the connection; one clone can sit in `recv` while another
/// sends.
#[derive(Clone, Debug)]
pub struct CryptoClient {
    conn: CryptoConn,
    id: ConnId,
    config: Arc<Config>,
}

impl CryptoClient {
    /// Connect to `config.addr` and negotiate a session key.
    pub async fn connect(config: Arc<Config>) -> Result<Self> {
        config.validate()?;
        let stream = TcpStream::connect(&config.addr).await?;
        info!("Connected to CryptoTCP server at {}", config.addr);

        let conn = CryptoConn::new(stream, &config);
        match initiate(&conn, &config).await {
            Ok(id) => Ok(Self { conn, id, config }),
            Err(e) => {
                conn.close().await;
                Err(e)
            }
        }
    }

    /// Id assigned by the server.
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn server_id(&self) -> ConnId {
        self.config.server_id
    }

    /// The underlying connection, for raw frame access.
    pub fn conn(&self) -> &CryptoConn {
        &self.conn
    }

    /// One-line connection summary.
    pub fn status(&self) -> String {
        self.conn.to_string()
    }

    /// Send `body` to `to` under the session key.
    pub async fn send(&self, to: ConnId, body: impl Into<Vec<u8>>) -> Result<()> {
        self.send_with(MsgType::EncryptedSymmetric, to, body).await
    }

    /// Send with an explicit crypto payload type.
    pub async fn send_with(
        &self,
        msg_type: MsgType,
        to: ConnId,
        body: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.conn.write_crypto(msg_type, self.id, to, body).await
    }

    /// Next decrypted payload message, or `None` once the server hangs up.
    /// Frames that fail to decode or decrypt are skipped.
    pub async fn recv(&self) -> Result<Option<Envelope>> {
        loop {
            let mut msg = match self.conn.read_message().await {
                Ok(msg) => msg,
                Err(CryptoTcpError::Decode(e)) => {
                    debug!("Discarding malformed frame: {}", e);
                    continue;
                }
                Err(CryptoTcpError::ConnectionClosed) => return Ok(None),
                Err(e) => return Err(e),
            };
            if !msg.msg_type.is_crypto_payload() {
                debug!("Ignoring {:?} after handshake", msg.msg_type);
                continue;
            }
            match self.conn.decrypt(&mut msg) {
                Ok(()) => return Ok(Some(msg)),
                Err(e) => debug!("Discarding undecryptable message: {}", e),
            }
        }
    }

    pub async fn close(&self) {
        self.conn.close().await;
        info!("Connection {} closed", self.id);
    }
}
