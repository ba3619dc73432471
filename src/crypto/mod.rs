//! Shared cryptographic primitives: AES-CBC for signal envelopes and X25519
//! key pairs with XEd25519 signatures. AEAD framing and HKDF steps live
//! with their protocols (noise transport, signal ratchet, link-code
//! pairing) since each uses them differently.

pub mod cbc;
pub mod key_pair;
pub mod xed25519;
