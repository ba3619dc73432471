pub mod binary;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event_bus;
pub mod proto;
pub mod signal;
pub mod socket;
pub mod store;
pub mod types;

pub mod client;
pub mod handshake;
pub mod keepalive;
pub mod message;
pub mod pair;
pub mod pair_code;
pub mod prekeys;
pub mod qrcode;
pub mod receipt;
pub mod request;
pub mod send;
pub mod usync;

pub use binary::jid::Jid;
pub use binary::node::{Node, NodeContent};
pub use client::Client;
pub use config::SocketConfig;
pub use error::{ClientError, ErrorKind};
pub use types::events::Event;
