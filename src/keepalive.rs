use crate::binary::jid::Jid;
use crate::binary::node::{NodeBuilder, NodeContent};
use crate::client::Client;
use crate::error::ClientError;
use crate::request::InfoQuery;
use log::{debug, info, warn};
use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const KEEP_ALIVE_JITTER: Duration = Duration::from_secs(5);
const KEEP_ALIVE_MAX_FAIL_TIME: Duration = Duration::from_secs(180);
const KEEP_ALIVE_RESPONSE_DEADLINE: Duration = Duration::from_secs(20);

async fn send_keepalive(client: &Client) -> bool {
    if !client.is_connected() {
        return false;
    }
    debug!(target: "Client/Keepalive", "sending ping");
    let iq = InfoQuery {
        timeout: Some(KEEP_ALIVE_RESPONSE_DEADLINE),
        content: Some(NodeContent::Nodes(vec![NodeBuilder::new("ping").build()])),
        ..InfoQuery::get("w:p", Jid::server_jid(), None)
    };
    match client.send_iq(iq).await {
        Ok(_) => true,
        Err(e) => {
            warn!(target: "Client/Keepalive", "ping failed: {e}");
            // Transport-level failures mean the connection is already gone;
            // anything else counts as a missed pong.
            !matches!(e, ClientError::Socket(_) | ClientError::NotConnected)
        }
    }
}

/// Timer-driven ping loop. The interval is jittered around the configured
/// value; sustained failure forces a disconnect so the supervisor can
/// reconnect.
pub(crate) async fn keepalive_loop(client: Arc<Client>) {
    let mut last_success = tokio::time::Instant::now();
    let mut error_count = 0u32;

    loop {
        let base = client.config.keep_alive_interval;
        let jitter_range = KEEP_ALIVE_JITTER.as_millis() as i64;
        let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        let interval = if offset >= 0 {
            base + Duration::from_millis(offset as u64)
        } else {
            base.saturating_sub(Duration::from_millis((-offset) as u64))
        };

        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if !client.is_connected() {
                    debug!(target: "Client/Keepalive", "not connected, exiting");
                    return;
                }
                if send_keepalive(&client).await {
                    if error_count > 0 {
                        info!(target: "Client/Keepalive", "keepalive restored");
                    }
                    error_count = 0;
                    last_success = tokio::time::Instant::now();
                } else {
                    error_count += 1;
                    warn!(target: "Client/Keepalive", "keepalive miss #{error_count}");
                    if client.enable_auto_reconnect.load(Ordering::Relaxed)
                        && last_success.elapsed() > KEEP_ALIVE_MAX_FAIL_TIME
                    {
                        warn!(
                            target: "Client/Keepalive",
                            "no pong for {}s, treating connection as stale",
                            KEEP_ALIVE_MAX_FAIL_TIME.as_secs()
                        );
                        client.shutdown.notify_waiters();
                        return;
                    }
                }
            }
            _ = client.shutdown.notified() => {
                debug!(target: "Client/Keepalive", "shutdown signalled, exiting");
                return;
            }
        }
    }
}
