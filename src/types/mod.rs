pub mod events;
pub mod message;

pub use crate::binary::jid::{Jid, MessageId};
