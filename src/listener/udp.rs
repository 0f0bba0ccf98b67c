use crate::canonical::RawRecord;
use crate::listener::{canonical_ip, SharedRoutes, MAX_UDP_RECORD};
use crate::metrics::MetricsRegistry;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Receive loop for one UDP endpoint. One datagram is one record; the
/// peer IP selects the source. Datagrams from unknown peers are dropped
/// silently and counted; payloads that are not valid UTF-8 count as
/// parse drops against their source.
pub async fn run_udp(
    socket: UdpSocket,
    routes: SharedRoutes,
    registry: Arc<MetricsRegistry>,
    cancel: CancellationToken,
) {
    // recv_from truncates datagrams beyond the buffer
    let mut buf = vec![0u8; MAX_UDP_RECORD];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                let (len, peer) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "UDP receive error");
                        continue;
                    }
                };

                let table = routes.snapshot();
                let Some(route) = table.get(&canonical_ip(peer.ip())) else {
                    registry.unknown_peer_drops.fetch_add(1, Ordering::Relaxed);
                    continue;
                };

                match std::str::from_utf8(&buf[..len]) {
                    Ok(text) => route.queue.enqueue(RawRecord::new(text.to_string())),
                    Err(_) => {
                        route
                            .queue
                            .metrics()
                            .events_dropped_parse
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    debug!("UDP endpoint closed");
}
