//! A framed, optionally encrypted TCP connection.
//!
//! Each `CryptoConn` owns a background task that reads the socket in chunks
//! of at most `read_chunk_size` bytes, reassembles frames and pushes them onto
//! a bounded queue. A full queue stalls the socket reads, which is the
//! connection's flow control. Consumers pull frames with [`CryptoConn::read_frame`]
//! or envelopes with [`CryptoConn::read_message`].
//!
//! The connection also carries its handshake state: the local RSA keypair,
//! the peer's public key and, once the handshake succeeded, the session key.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::SinkExt;
use rsa::RsaPublicKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace};

use crate::codec::{FrameAssembler, LineCodec};
use crate::config::Config;
use crate::crypto::{rsa_encrypt, KeyPair, SessionKey};
use crate::envelope::Envelope;
use crate::types::{ConnId, CryptoTcpError, MsgType, Result};

#[derive(Default)]
struct CryptoState {
    id: Option<ConnId>,
    local_keys: Option<Arc<KeyPair>>,
    remote_key: Option<RsaPublicKey>,
    // Present exactly when the handshake has completed.
    session_key: Option<SessionKey>,
}

struct ConnInner {
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, LineCodec>>,
    frames: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    state: parking_lot::Mutex<CryptoState>,
    living: AtomicBool,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl ConnInner {
    async fn shutdown_stream(&self) {
        self.living.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            trace!("Shutdown of write half failed: {}", e);
        }
    }
}

/// Handle to a framed connection. Clones share the same connection.
#[derive(Clone)]
pub struct CryptoConn {
    inner: Arc<ConnInner>,
}

impl CryptoConn {
    /// Wrap a connected stream and start its reassembly task.
    pub fn new(stream: TcpStream, config: &Config) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(config.frame_queue_size);

        let inner = Arc::new(ConnInner {
            writer: tokio::sync::Mutex::new(FramedWrite::new(write_half, LineCodec::new())),
            frames: tokio::sync::Mutex::new(rx),
            reader: parking_lot::Mutex::new(None),
            state: parking_lot::Mutex::new(CryptoState::default()),
            living: AtomicBool::new(true),
            local_addr,
            peer_addr,
        });

        let chunk_size = config.read_chunk_size;
        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            pump_frames(read_half, tx, chunk_size).await;
            task_inner.shutdown_stream().await;
        });
        *inner.reader.lock() = Some(handle);

        Self { inner }
    }

    /// Assigned id, if one is known yet.
    pub fn id(&self) -> Option<ConnId> {
        self.inner.state.lock().id
    }

    pub(crate) fn set_id(&self, id: ConnId) {
        self.inner.state.lock().id = Some(id);
    }

    pub fn is_living(&self) -> bool {
        self.inner.living.load(Ordering::SeqCst)
    }

    /// Whether the handshake has completed on this connection.
    pub fn is_crypto(&self) -> bool {
        self.inner.state.lock().session_key.is_some()
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.inner.state.lock().session_key.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Record the keys negotiated by a successful handshake. Fails if the
    /// connection was already established; the transition happens once.
    pub(crate) fn establish(
        &self,
        id: ConnId,
        local_keys: Arc<KeyPair>,
        remote_key: RsaPublicKey,
        session_key: SessionKey,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.session_key.is_some() {
            return Err(CryptoTcpError::AlreadyCrypto);
        }
        state.id = Some(id);
        state.local_keys = Some(local_keys);
        state.remote_key = Some(remote_key);
        state.session_key = Some(session_key);
        Ok(())
    }

    /// Wait for the next complete frame. `None` means the stream has ended.
    pub async fn read_frame(&self) -> Option<Bytes> {
        self.inner.frames.lock().await.recv().await
    }

    /// Send one frame; the delimiter is appended by the codec.
    pub async fn write_frame(&self, data: Bytes) -> Result<()> {
        if !self.is_living() {
            return Err(CryptoTcpError::ConnectionClosed);
        }
        self.inner.writer.lock().await.send(data).await
    }

    /// Read and decode the next envelope. A `Decode` error only concerns
    /// that one frame; `ConnectionClosed` is final.
    pub async fn read_message(&self) -> Result<Envelope> {
        let frame = self.read_frame().await.ok_or(CryptoTcpError::ConnectionClosed)?;
        Envelope::unmarshal(&frame)
    }

    pub async fn write_message(&self, msg: &Envelope) -> Result<()> {
        self.write_frame(Bytes::from(msg.marshal()?)).await
    }

    /// Decrypt the body in place according to the message type.
    pub fn decrypt(&self, msg: &mut Envelope) -> Result<()> {
        let state = self.inner.state.lock();
        msg.body = match msg.msg_type {
            MsgType::EncryptedAsymmetric => state
                .local_keys
                .as_ref()
                .ok_or_else(|| missing("local private key"))?
                .decrypt(&msg.body)?,
            MsgType::EncryptedSymmetric => state
                .session_key
                .as_ref()
                .ok_or_else(|| missing("session key"))?
                .decrypt(&msg.body)?,
            other => return Err(CryptoTcpError::InvalidMessageType(other)),
        };
        Ok(())
    }

    /// Encrypt the body for the peer and send the envelope.
    pub async fn encrypt_and_send(&self, mut msg: Envelope) -> Result<()> {
        msg.body = {
            let state = self.inner.state.lock();
            match msg.msg_type {
                MsgType::EncryptedAsymmetric => rsa_encrypt(
                    state.remote_key.as_ref().ok_or_else(|| missing("remote public key"))?,
                    &msg.body,
                )?,
                MsgType::EncryptedSymmetric => state
                    .session_key
                    .as_ref()
                    .ok_or_else(|| missing("session key"))?
                    .encrypt(&msg.body)?,
                other => return Err(CryptoTcpError::InvalidMessageType(other)),
            }
        };
        self.write_message(&msg).await
    }

    pub async fn write_crypto(
        &self,
        msg_type: MsgType,
        from: ConnId,
        to: ConnId,
        body: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.encrypt_and_send(Envelope::new(msg_type, from, to).with_body(body))
            .await
    }

    /// Close the stream. Pending and future reads observe end-of-stream.
    pub async fn close(&self) {
        let reader = self.inner.reader.lock().take();
        if let Some(handle) = reader {
            handle.abort();
        }
        self.inner.shutdown_stream().await;
    }
}

impl fmt::Display for CryptoConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = |a: Option<SocketAddr>| a.map_or_else(|| "?".to_string(), |a| a.to_string());
        let id = self.id().map_or_else(|| "-".to_string(), |id| id.to_string());
        write!(
            f,
            "CID:{}, Living:{}, Crypto:{}, LAddr:{}, RAddr:{}",
            id,
            self.is_living(),
            self.is_crypto(),
            addr(self.local_addr()),
            addr(self.peer_addr())
        )
    }
}

impl fmt::Debug for CryptoConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoConn({})", self)
    }
}

fn missing(what: &str) -> CryptoTcpError {
    CryptoTcpError::Crypto(format!("no {} on this connection", what))
}

/// Read `reader` in chunks of at most `chunk_size` bytes and forward every
/// complete frame to `tx`. Returns on end-of-stream, read error, or when the
/// receiving side is gone.
pub(crate) async fn pump_frames<R>(mut reader: R, tx: mpsc::Sender<Bytes>, chunk_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut assembler = FrameAssembler::new();
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Stream closed by peer");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("Stream read failed: {}", e);
                return;
            }
        };
        for frame in assembler.push(&buf[..n]) {
            if tx.send(frame).await.is_err() {
                return;
            }
        }
    }
}
