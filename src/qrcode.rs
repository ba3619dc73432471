//! Client-facing QR channel: rotates through the server-issued refs until
//! one is scanned or they run out.

use crate::client::Client;
use crate::event_bus::EventHandler;
use crate::types::events::{Event, PairError};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

const FIRST_CODE_TIMEOUT: Duration = Duration::from_secs(60);
const CODE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub enum QrCodeEvent {
    Code { code: String, timeout: Duration },
    Success,
    Timeout,
    Error(PairError),
    LoggedOut,
    ClientOutdated,
}

#[derive(Debug, Error)]
pub enum QrError {
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("client is already logged in")]
    AlreadyLoggedIn,
}

enum QrAction {
    EmitCodes(Vec<String>),
    Terminal(QrCodeEvent),
}

struct QrEventHandler {
    actions: mpsc::UnboundedSender<QrAction>,
}

impl EventHandler for QrEventHandler {
    fn handle_event(&self, event: &Event) {
        let action = match event {
            Event::Qr(qr) => Some(QrAction::EmitCodes(qr.codes.clone())),
            Event::PairSuccess(_) => Some(QrAction::Terminal(QrCodeEvent::Success)),
            Event::PairError(e) => Some(QrAction::Terminal(QrCodeEvent::Error(e.clone()))),
            Event::LoggedOut(_) => Some(QrAction::Terminal(QrCodeEvent::LoggedOut)),
            _ => None,
        };
        if let Some(action) = action {
            let _ = self.actions.send(action);
        }
    }
}

/// Subscribes a channel that yields QR codes with their display timeouts,
/// ending with a terminal event. Must be called before `connect`.
pub async fn get_qr_channel(client: &Client) -> Result<mpsc::Receiver<QrCodeEvent>, QrError> {
    if client.is_connected() {
        return Err(QrError::AlreadyConnected);
    }
    if client.store.me().await.is_some() {
        return Err(QrError::AlreadyLoggedIn);
    }

    let (output_tx, output_rx) = mpsc::channel(8);
    let (action_tx, mut action_rx) = mpsc::unbounded_channel();

    client
        .event_bus
        .add_handler(Arc::new(QrEventHandler { actions: action_tx }));

    tokio::spawn(async move {
        let closed = AtomicBool::new(false);
        let (stop_tx, _) = watch::channel(());

        while let Some(action) = action_rx.recv().await {
            match action {
                QrAction::EmitCodes(codes) => {
                    debug!(target: "Client/QR", "rotating through {} codes", codes.len());
                    let output = output_tx.clone();
                    let stop_rx = stop_tx.subscribe();
                    tokio::spawn(emit_codes(output, stop_rx, codes));
                }
                QrAction::Terminal(event) => {
                    let _ = stop_tx.send(());
                    if closed
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        debug!(target: "Client/QR", "closing QR channel: {event:?}");
                        let _ = output_tx.send(event).await;
                    }
                    return;
                }
            }
        }
    });

    Ok(output_rx)
}

async fn emit_codes(
    output: mpsc::Sender<QrCodeEvent>,
    mut stop_rx: watch::Receiver<()>,
    codes: Vec<String>,
) {
    let mut first = true;
    for code in codes {
        let timeout = if first { FIRST_CODE_TIMEOUT } else { CODE_TIMEOUT };
        first = false;

        if output
            .send(QrCodeEvent::Code { code, timeout })
            .await
            .is_err()
        {
            debug!(target: "Client/QR", "QR receiver dropped, stopping rotation");
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = stop_rx.changed() => {
                debug!(target: "Client/QR", "QR rotation stopped");
                return;
            }
        }
    }
    debug!(target: "Client/QR", "ran out of QR refs");
    let _ = output.try_send(QrCodeEvent::Timeout);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketConfig;
    use crate::store::memory::MemoryStore;
    use crate::store::{AuthCreds, DeviceStore};
    use crate::types::events::Qr;

    #[tokio::test(start_paused = true)]
    async fn qr_channel_rotates_and_terminates() {
        let store = DeviceStore::new(AuthCreds::init(), Arc::new(MemoryStore::new()));
        let client = Client::new(SocketConfig::default(), store);

        let mut rx = get_qr_channel(&client).await.unwrap();
        client.emit(Event::Qr(Qr {
            codes: vec!["ref1,a,b,c".into(), "ref2,a,b,c".into()],
        }));

        match rx.recv().await.unwrap() {
            QrCodeEvent::Code { code, timeout } => {
                assert!(code.starts_with("ref1"));
                assert_eq!(timeout, FIRST_CODE_TIMEOUT);
            }
            other => panic!("expected first code, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            QrCodeEvent::Code { code, timeout } => {
                assert!(code.starts_with("ref2"));
                assert_eq!(timeout, CODE_TIMEOUT);
            }
            other => panic!("expected second code, got {other:?}"),
        }
        // Out of refs: the rotation reports a timeout.
        match rx.recv().await.unwrap() {
            QrCodeEvent::Timeout => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn qr_channel_rejects_logged_in_clients() {
        let store = DeviceStore::new(AuthCreds::init(), Arc::new(MemoryStore::new()));
        store
            .process_command(crate::store::commands::DeviceCommand::SetMe(Some(
                "123@s.whatsapp.net".parse().unwrap(),
            )))
            .await;
        let client = Client::new(SocketConfig::default(), store);
        assert!(matches!(
            get_qr_channel(&client).await,
            Err(QrError::AlreadyLoggedIn)
        ));
    }
}
