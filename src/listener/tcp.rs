use crate::canonical::RawRecord;
use crate::listener::{canonical_ip, Route, SharedRoutes, MAX_TCP_RECORD};
use crate::metrics::MetricsRegistry;
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Accept loop for one TCP endpoint. A connection is bound to a source
/// by its peer IP at accept time and keeps that binding for its whole
/// life, regardless of later routing table swaps. Connections from
/// unknown peers are closed immediately and counted.
///
/// Connection tasks are tracked; this function only returns once every
/// connection has closed (bounded by the drain deadline), so awaiting
/// the endpoint task guarantees its sockets are gone.
pub async fn run_tcp(
    listener: TcpListener,
    routes: SharedRoutes,
    registry: Arc<MetricsRegistry>,
    idle_timeout: Duration,
    drain_deadline: Duration,
    cancel: CancellationToken,
) {
    let mut connections: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "TCP accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                let table = routes.snapshot();
                let Some(route) = table.get(&canonical_ip(peer.ip())) else {
                    registry.unknown_peer_drops.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %peer, "Closing connection from unknown peer");
                    continue;
                };

                connections.spawn(run_connection(
                    stream,
                    route.clone(),
                    idle_timeout,
                    cancel.child_token(),
                ));
            }
        }
    }

    // Child tokens are cancelled with the endpoint; connections get the
    // drain window to finish their in-flight read
    let drained = tokio::time::timeout(drain_deadline, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("TCP connections exceeded drain deadline, aborting");
        connections.shutdown().await;
    }

    debug!("TCP endpoint closed");
}

/// Read one line-delimited stream. Each LF-terminated line is one
/// record (the codec tolerates CRLF). Lines over the size cap count as
/// parse drops; idle connections close after the inactivity window.
async fn run_connection(
    stream: TcpStream,
    route: Route,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut framed = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_TCP_RECORD));

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(idle_timeout, framed.next()) => next,
        };

        match next {
            Err(_) => {
                debug!("Closing idle TCP connection");
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(line))) => {
                route.queue.enqueue(RawRecord::new(line));
            }
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                route
                    .queue
                    .metrics()
                    .events_dropped_parse
                    .fetch_add(1, Ordering::Relaxed);
                // FramedRead terminates its stream after a decode error
                warn!("Oversize TCP record, closing connection");
                break;
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => {
                debug!(error = %e, "TCP read error, closing connection");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::RouteTable;
    use crate::metrics::SourceMetrics;
    use crate::pipeline::SourceQueue;
    use std::collections::HashMap;
    use tokio::io::AsyncWriteExt;
    use uuid::Uuid;

    async fn fixture() -> (
        std::net::SocketAddr,
        SourceQueue,
        Arc<SourceMetrics>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let queue = SourceQueue::new(100);
        let metrics = Arc::new(SourceMetrics::default());
        let mut table: RouteTable = HashMap::new();
        table.insert(
            "127.0.0.1".parse().unwrap(),
            Route {
                source_id: Uuid::new_v4(),
                queue: queue.handle(metrics.clone()),
            },
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_tcp(
            listener,
            SharedRoutes::new(table),
            Arc::new(MetricsRegistry::new()),
            Duration::from_secs(60),
            Duration::from_secs(5),
            cancel.clone(),
        ));

        (addr, queue, metrics, cancel, handle)
    }

    #[tokio::test]
    async fn test_lines_become_records_in_order() {
        let (addr, queue, _metrics, cancel, _handle) = fixture().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"one\ntwo\nthree\n").await.unwrap();
        client.flush().await.unwrap();

        let rx = queue.receiver();
        for expected in ["one", "two", "three"] {
            let record = tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.payload, expected);
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_crlf_tolerated() {
        let (addr, queue, _metrics, cancel, _handle) = fixture().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"windows line\r\n").await.unwrap();
        client.flush().await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(2), queue.receiver().recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.payload, "windows line");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_connection_survives_across_many_lines() {
        let (addr, queue, metrics, cancel, _handle) = fixture().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        for i in 0..50 {
            client
                .write_all(format!("line-{}\n", i).as_bytes())
                .await
                .unwrap();
        }
        client.flush().await.unwrap();

        let rx = queue.receiver();
        for _ in 0..50 {
            tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(metrics.events_in.load(Ordering::Relaxed), 50);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_oversize_line_counted_and_connection_closed() {
        let (addr, queue, metrics, cancel, _handle) = fixture().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut big = vec![b'a'; MAX_TCP_RECORD + 16];
        big.push(b'\n');
        // The server may close the connection before the whole write lands
        let _ = client.write_all(&big).await;
        let _ = client.flush().await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while metrics.events_dropped_parse.load(Ordering::Relaxed) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(queue.depth(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_endpoint_close_awaits_connections() {
        use tokio::io::AsyncReadExt;

        let (addr, queue, _metrics, cancel, handle) = fixture().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello\n").await.unwrap();
        client.flush().await.unwrap();

        // The record arriving proves the connection task is up
        tokio::time::timeout(Duration::from_secs(2), queue.receiver().recv_async())
            .await
            .unwrap()
            .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap();

        // The endpoint task only returns after the connection dropped
        // its socket, so the client sees EOF
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
