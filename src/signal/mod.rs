//! Compact signal-protocol implementation: X3DH session setup, double
//! ratchet session cipher, and group sender-key cipher.

pub mod address;
pub mod error;
pub mod group;
pub mod keyhelper;
pub mod ratchet;
pub mod record;
pub mod session;
pub mod store;

pub use address::{SenderKeyName, SignalAddress};
pub use error::{SignalError, SignalResult};
pub use session::{
    message_decrypt, message_decrypt_prekey, message_encrypt, process_prekey_bundle,
    CiphertextType, PreKeyBundle,
};
