//! TCP transport: the multiplexing server and the client.

pub mod client;
pub mod server;

pub use client::CryptoClient;
pub use server::CryptoServer;
