//! # CryptoTCP
//!
//! A multiplexed TCP messaging substrate with per-connection session keys:
//!
//! * **One server, many clients** - every connection gets a small numeric id
//! * **Encrypted by default** - an RSA handshake delivers an AES session key
//! * **Routed** - clients address each other by id; the server re-encrypts
//!   each message for its recipient
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cryptotcp::{Config, CryptoClient, CryptoServer};
//!
//! # async fn demo() -> cryptotcp::Result<()> {
//! let server = CryptoServer::bind(Config::default()).await?;
//! let runner = server.clone();
//! tokio::spawn(async move { runner.run().await });
//!
//! let client = CryptoClient::connect(Arc::new(Config::default())).await?;
//! client.send(client.server_id(), "Hello, server!").await?;
//! if let Some(reply) = client.recv().await? {
//!     println!("{} say: {}", reply.from, reply.body_str());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Wire Format
//!
//! One JSON envelope per line, terminated by `\n`:
//!
//! - **msgType**: message type code (see below)
//! - **from** / **to**: connection ids; the server's own id is `1000`
//! - **body**: payload, base64, encrypted for payload types
//! - **RSAPubKey**: PKCS#1 DER public key, base64 (handshake)
//! - **AESKey**: session key sealed with the client's RSA key, base64 (accept)
//! - **sign**: reserved
//!
//! Empty byte fields are omitted.
//!
//! ## Message Types
//!
//! | Code | Name                | Direction       | Description                    |
//! |------|---------------------|-----------------|--------------------------------|
//! | 1    | HandshakeRequest    | Client → Server | Offer client public key        |
//! | 2    | HandshakeAccept     | Server → Client | Assigned id + sealed AES key   |
//! | 3    | HandshakeReject     | Server → Client | Handshake refused              |
//! | 4    | EncryptedAsymmetric | Both            | Body encrypted with RSA        |
//! | 5    | EncryptedSymmetric  | Both            | Body encrypted with AES-CBC    |
//!
//! ## Security Notes
//!
//! Session keys are drawn from `[0-9a-z]` and the CBC IV is the first block of
//! the key. There is no peer authentication and no handshake timeout. Treat
//! the encryption as traffic obfuscation between a trusted server and its
//! clients, not as a hardened channel.

pub mod cli;
pub mod codec;
pub mod config;
pub mod conn;
pub mod crypto;
pub mod envelope;
pub mod handshake;
pub mod idpool;
pub mod tcp;
pub mod types;

// Re-export main types for convenience
pub use types::{ConnId, CryptoTcpError, MsgType, Result, ECHO_PREFIX, FRAME_DELIMITER};

pub use codec::{FrameAssembler, LineCodec};
pub use config::Config;
pub use conn::CryptoConn;
pub use envelope::Envelope;
pub use idpool::{IdPool, PoolStats};
pub use tcp::{CryptoClient, CryptoServer};
