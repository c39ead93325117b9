use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::conn::CryptoConn;
use crate::crypto::KeyPair;
use crate::envelope::Envelope;
use crate::handshake::{generate_keypair, respond};
use crate::idpool::{IdPool, PoolStats};
use crate::types::{ConnId, CryptoTcpError, MsgType, Result, ECHO_PREFIX};

struct ServerInner {
    listener: TcpListener,
    config: Arc<Config>,
    keys: Arc<KeyPair>,
    public_key_der: Vec<u8>,
    registry: DashMap<ConnId, CryptoConn>,
    pool: IdPool,
    msg_tx: mpsc::Sender<Envelope>,
    exit_tx: mpsc::Sender<CryptoConn>,
    receivers: parking_lot::Mutex<Option<(mpsc::Receiver<Envelope>, mpsc::Receiver<CryptoConn>)>>,
}

/// TCP server that multiplexes encrypted client connections.
///
/// Every accepted connection gets an id from the pool and its own reader
/// task. Readers feed one shared bounded channel; a single dispatch task
/// drains it in arrival order, answering handshakes, echoing messages sent to
/// the server id and forwarding everything else to the destination client.
#[derive(Clone)]
pub struct CryptoServer {
    inner: Arc<ServerInner>,
}

impl CryptoServer {
    /// Validate the config, generate the server keypair and bind.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let keys = Arc::new(generate_keypair(config.rsa_bits).await?);
        let public_key_der = keys.public_key_der()?;
        let listener = TcpListener::bind(&config.addr).await?;
        info!("CryptoTCP server bound to {}", listener.local_addr()?);

        let (msg_tx, msg_rx) = mpsc::channel(config.msg_chan_size);
        let (exit_tx, exit_rx) = mpsc::channel(config.exit_chan_size);

        Ok(Self {
            inner: Arc::new(ServerInner {
                listener,
                keys,
                public_key_der,
                registry: DashMap::new(),
                pool: IdPool::new(config.pool_capacity),
                msg_tx,
                exit_tx,
                receivers: parking_lot::Mutex::new(Some((msg_rx, exit_rx))),
                config: Arc::new(config),
            }),
        })
    }

    /// Get the local address this server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.listener.local_addr().map_err(CryptoTcpError::Io)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// PKCS#1 DER encoding of the server public key.
    pub fn public_key_der(&self) -> &[u8] {
        &self.inner.public_key_der
    }

    /// Accept connections until the listener fails. May only be called once.
    pub async fn run(&self) -> Result<()> {
        let (msg_rx, exit_rx) = self.inner.receivers.lock().take().ok_or_else(|| {
            CryptoTcpError::InvalidConfig("server is already running".to_string())
        })?;

        tokio::spawn(self.inner.clone().on_close(exit_rx));
        tokio::spawn(self.inner.clone().on_msg_mux(msg_rx));
        info!("CryptoTCP server starting...");

        loop {
            match self.inner.listener.accept().await {
                Ok((socket, addr)) => self.inner.on_accept(socket, addr),
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }

    /// Number of ids currently handed out.
    pub fn conn_count(&self) -> usize {
        self.inner.pool.using()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Snapshot of the registered connections, ordered by id.
    pub fn connections(&self) -> Vec<CryptoConn> {
        let mut conns: Vec<(ConnId, CryptoConn)> = self
            .inner
            .registry
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        conns.sort_by_key(|(id, _)| *id);
        conns.into_iter().map(|(_, conn)| conn).collect()
    }

    pub fn get(&self, id: ConnId) -> Result<CryptoConn> {
        self.inner.get(id)
    }

    /// Send `text` from the server to client `id` under its session key.
    pub async fn send_to(&self, id: ConnId, text: &str) -> Result<()> {
        let conn = self.get(id)?;
        conn.write_crypto(MsgType::EncryptedSymmetric, self.inner.config.server_id, id, text)
            .await
    }
}

impl ServerInner {
    fn get(&self, id: ConnId) -> Result<CryptoConn> {
        self.registry
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(CryptoTcpError::CidNotExist(id))
    }

    fn on_accept(self: &Arc<Self>, socket: TcpStream, addr: SocketAddr) {
        let slot = match self.pool.assign() {
            Ok(slot) => slot,
            Err(e) => {
                warn!("Refusing connection from {}: {}", addr, e);
                return;
            }
        };
        let id = self.config.start_conn_id + slot;
        let conn = CryptoConn::new(socket, &self.config);
        conn.set_id(id);
        self.registry.insert(id, conn.clone());
        info!("New connection {} from {}", id, addr);

        let inner = self.clone();
        tokio::spawn(async move { inner.serve_connection(id, conn).await });
    }

    /// Forward every decodable message from one connection to the
    /// dispatcher, stamped with the connection's real id.
    async fn serve_connection(&self, id: ConnId, conn: CryptoConn) {
        loop {
            match conn.read_message().await {
                Ok(mut msg) => {
                    msg.from = id;
                    debug!("Connection {} sent {:?} to {}", id, msg.msg_type, msg.to);
                    if self.msg_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(CryptoTcpError::Decode(e)) => {
                    debug!("Connection {} sent malformed frame: {}", id, e);
                }
                Err(_) => break,
            }
        }
        let _ = self.exit_tx.send(conn).await;
    }

    async fn on_close(self: Arc<Self>, mut exit_rx: mpsc::Receiver<CryptoConn>) {
        while let Some(conn) = exit_rx.recv().await {
            conn.close().await;
            if let Some(id) = conn.id() {
                self.registry.remove(&id);
                self.pool.recycle(id - self.config.start_conn_id);
                info!("Connection {} closed ({:?})", id, conn.peer_addr());
            }
        }
    }

    async fn on_msg_mux(self: Arc<Self>, mut msg_rx: mpsc::Receiver<Envelope>) {
        while let Some(msg) = msg_rx.recv().await {
            let conn = match self.get(msg.from) {
                Ok(conn) => conn,
                Err(_) => {
                    debug!("Dropping message from departed connection {}", msg.from);
                    continue;
                }
            };
            if let Err(e) = self.dispatch(&conn, msg).await {
                warn!("Dropped message: {}", e);
            }
        }
    }

    async fn dispatch(&self, conn: &CryptoConn, msg: Envelope) -> Result<()> {
        match msg.msg_type {
            MsgType::HandshakeRequest => respond(conn, &self.keys, &msg, &self.config).await,
            t if t.is_crypto_payload() => {
                if msg.to == self.config.server_id {
                    self.on_to_server_msg(conn, msg).await
                } else {
                    self.on_forward_msg(conn, msg).await
                }
            }
            other => {
                debug!("Ignoring {:?} from {}", other, msg.from);
                Ok(())
            }
        }
    }

    async fn on_to_server_msg(&self, conn: &CryptoConn, mut msg: Envelope) -> Result<()> {
        conn.decrypt(&mut msg)?;
        info!("{} says to server: {}", msg.from, msg.body_str());
        let mut body = ECHO_PREFIX.as_bytes().to_vec();
        body.extend_from_slice(&msg.body);
        msg.to = msg.from;
        msg.from = self.config.server_id;
        msg.body = body;
        conn.encrypt_and_send(msg).await
    }

    async fn on_forward_msg(&self, conn: &CryptoConn, mut msg: Envelope) -> Result<()> {
        let dest = self.get(msg.to)?;
        conn.decrypt(&mut msg)?;
        dest.encrypt_and_send(msg).await
    }
}
