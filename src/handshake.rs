//! Drives the Noise XX exchange over a freshly opened frame socket and
//! produces the encrypted [`NoiseSocket`].

use crate::config::SocketConfig;
use crate::crypto::key_pair::KeyPair;
use crate::proto;
use crate::socket::consts::{NOISE_START_PATTERN, WA_CONN_HEADER};
use crate::socket::error::SocketError;
use crate::socket::{FrameSocket, NoiseHandshake, NoiseSocket};
use crate::store::DeviceStore;
use log::{debug, info};
use prost::Message as ProstMessage;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};

const HANDSHAKE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
    #[error("timed out waiting for the server hello")]
    Timeout,
    #[error("malformed handshake message: {0}")]
    Malformed(&'static str),
    #[error("protobuf decode failed: {0}")]
    Proto(#[from] prost::DecodeError),
}

type Result<T> = std::result::Result<T, HandshakeError>;

pub async fn do_handshake(
    store: &DeviceStore,
    config: &SocketConfig,
    frame_socket: &FrameSocket,
    frames_rx: &mut Receiver<bytes::Bytes>,
) -> Result<NoiseSocket> {
    let creds = store.creds().await;
    let ephemeral = KeyPair::new();

    let mut state = NoiseHandshake::new(NOISE_START_PATTERN, &WA_CONN_HEADER);
    state.authenticate(&ephemeral.public_key);

    debug!(target: "Handshake", "--> ClientHello");
    let client_hello = proto::HandshakeMessage {
        client_hello: Some(proto::HandshakeClientHello {
            ephemeral: Some(ephemeral.public_key.to_vec()),
            r#static: None,
            payload: None,
        }),
        server_hello: None,
        client_finish: None,
    };
    frame_socket
        .send_frame(&client_hello.encode_to_vec())
        .await?;

    let resp_frame = timeout(HANDSHAKE_RESPONSE_TIMEOUT, frames_rx.recv())
        .await
        .map_err(|_| HandshakeError::Timeout)?
        .ok_or(HandshakeError::Timeout)?;

    debug!(target: "Handshake", "<-- ServerHello ({} bytes)", resp_frame.len());
    let server_hello = proto::HandshakeMessage::decode(resp_frame.as_ref())?
        .server_hello
        .ok_or(HandshakeError::Malformed("missing server hello"))?;

    let server_ephemeral: [u8; 32] = server_hello
        .ephemeral
        .as_deref()
        .and_then(|b| b.try_into().ok())
        .ok_or(HandshakeError::Malformed("bad server ephemeral"))?;
    let static_ciphertext = server_hello
        .r#static
        .ok_or(HandshakeError::Malformed("missing server static"))?;
    let cert_ciphertext = server_hello
        .payload
        .ok_or(HandshakeError::Malformed("missing server certificate"))?;

    state.authenticate(&server_ephemeral);
    state.mix_shared_secret(&ephemeral.private_key, &server_ephemeral)?;

    let server_static: [u8; 32] = state
        .decrypt(&static_ciphertext)?
        .as_slice()
        .try_into()
        .map_err(|_| HandshakeError::Malformed("bad server static length"))?;
    state.mix_shared_secret(&ephemeral.private_key, &server_static)?;

    // The certificate chain binds the static key; decrypting it under the
    // current transcript is what authenticates the server here.
    let _certificate = state.decrypt(&cert_ciphertext)?;

    let encrypted_static = state.encrypt(&creds.noise_key.public_key)?;
    state.mix_shared_secret(&creds.noise_key.private_key, &server_ephemeral)?;

    let client_payload = build_client_payload(store, config).await;
    let encrypted_payload = state.encrypt(&client_payload.encode_to_vec())?;

    debug!(target: "Handshake", "--> ClientFinish");
    let client_finish = proto::HandshakeMessage {
        client_hello: None,
        server_hello: None,
        client_finish: Some(proto::HandshakeClientFinish {
            r#static: Some(encrypted_static),
            payload: Some(encrypted_payload),
        }),
    };
    frame_socket
        .send_frame(&client_finish.encode_to_vec())
        .await?;

    let socket = state.finish()?;
    info!(target: "Handshake", "noise handshake complete, switching to encrypted frames");
    Ok(socket)
}

/// Builds the login payload for a paired device, or the registration payload
/// (with the full pairing key bundle) on first login.
pub async fn build_client_payload(store: &DeviceStore, config: &SocketConfig) -> proto::ClientPayload {
    let creds = store.creds().await;
    let user_agent = proto::UserAgent {
        platform: Some(proto::user_agent_platform::WEB),
        app_version: Some(proto::AppVersion {
            primary: Some(config.version.0),
            secondary: Some(config.version.1),
            tertiary: Some(config.version.2),
        }),
        mcc: Some("000".into()),
        mnc: Some("000".into()),
        os_version: Some(config.browser.2.clone()),
        manufacturer: Some(String::new()),
        device: Some(config.browser.1.clone()),
        os_build_number: Some(config.browser.2.clone()),
        release_channel: Some(0),
        locale_language_iso_639_1: Some("en".into()),
        locale_country_iso_3166_1_alpha_2: Some("US".into()),
    };

    match &creds.me {
        Some(me) => proto::ClientPayload {
            username: me.user.parse().ok(),
            passive: Some(false),
            user_agent: Some(user_agent),
            web_info: Some(proto::WebInfo {
                ref_token: None,
                version: None,
                web_sub_platform: Some(0),
            }),
            push_name: Some(creds.push_name.clone()),
            session_id: None,
            short_connect: Some(true),
            connect_type: Some(proto::connect_type::WIFI_UNKNOWN),
            connect_reason: Some(proto::connect_reason::USER_ACTIVATED),
            device: Some(me.device as u32),
            device_pairing_data: None,
            product: Some(0),
            pull: Some(true),
        },
        None => {
            let device_props = proto::DeviceProps {
                os: Some(config.browser.0.clone()),
                version: Some(proto::AppVersion {
                    primary: Some(config.version.0),
                    secondary: Some(config.version.1),
                    tertiary: Some(config.version.2),
                }),
                platform_type: Some(proto::device_props_platform_type::CHROME),
                require_full_sync: Some(config.sync_full_history),
            };
            let build_hash: [u8; 16] = Sha256::digest(
                format!("{}.{}.{}", config.version.0, config.version.1, config.version.2)
                    .as_bytes(),
            )[..16]
                .try_into()
                .expect("digest is long enough");

            proto::ClientPayload {
                username: None,
                passive: Some(false),
                user_agent: Some(user_agent),
                web_info: Some(proto::WebInfo {
                    ref_token: None,
                    version: None,
                    web_sub_platform: Some(0),
                }),
                push_name: None,
                session_id: None,
                short_connect: None,
                connect_type: Some(proto::connect_type::WIFI_UNKNOWN),
                connect_reason: Some(proto::connect_reason::USER_ACTIVATED),
                device: None,
                device_pairing_data: Some(proto::DevicePairingRegistrationData {
                    e_regid: Some(creds.registration_id.to_be_bytes().to_vec()),
                    e_keytype: Some(vec![crate::crypto::key_pair::DJB_TYPE]),
                    e_ident: Some(creds.signed_identity_key.public_key.to_vec()),
                    e_skey_id: Some(creds.signed_pre_key.key_id.to_be_bytes()[1..].to_vec()),
                    e_skey_val: Some(creds.signed_pre_key.key_pair.public_key.to_vec()),
                    e_skey_sig: creds.signed_pre_key.signature.map(|s| s.to_vec()),
                    build_hash: Some(build_hash.to_vec()),
                    device_props: Some(device_props.encode_to_vec()),
                }),
                product: Some(0),
                pull: Some(false),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{AuthCreds, DeviceStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn unpaired_payload_carries_registration_bundle() {
        let store = DeviceStore::new(AuthCreds::init(), Arc::new(MemoryStore::new()));
        let payload = build_client_payload(&store, &SocketConfig::default()).await;
        let pairing = payload.device_pairing_data.expect("registration data");
        assert_eq!(pairing.e_regid.unwrap().len(), 4);
        assert_eq!(pairing.e_keytype.unwrap(), vec![5]);
        assert_eq!(pairing.e_ident.unwrap().len(), 32);
        assert_eq!(pairing.e_skey_id.unwrap().len(), 3);
        assert_eq!(pairing.e_skey_sig.unwrap().len(), 64);
        assert!(payload.username.is_none());
    }

    #[tokio::test]
    async fn paired_payload_is_a_login() {
        let store = DeviceStore::new(AuthCreds::init(), Arc::new(MemoryStore::new()));
        store
            .process_command(crate::store::commands::DeviceCommand::SetMe(Some(
                "15551234567:3@s.whatsapp.net".parse().unwrap(),
            )))
            .await;
        let payload = build_client_payload(&store, &SocketConfig::default()).await;
        assert_eq!(payload.username, Some(15551234567));
        assert_eq!(payload.device, Some(3));
        assert!(payload.device_pairing_data.is_none());
    }
}
