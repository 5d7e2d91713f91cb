use crate::alerts::Alert;
use crate::api::binance::backoff::Backoff;
use crate::error::PriceWatchError;
use crate::shutdown::Shutdown;
use futures::future::join_all;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::{self, Message};

pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const ACCEPT_RETRY_BASE: Duration = Duration::from_millis(5);
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);

pub type ClientId = u64;

/// Write half of a subscriber connection.
pub type ClientSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

type SharedSink = Arc<AsyncMutex<ClientSink>>;

struct Client {
    sink: SharedSink,
    /// Task holding the read half. Aborting it drops that half.
    reader: Option<AbortHandle>,
}

/// Fans alerts out to every connected WebSocket subscriber.
///
/// The registry lock is only held to add, remove or copy out entries. Network
/// writes happen outside it, each bounded by the write timeout.
pub struct AlertServer {
    clients: Mutex<HashMap<ClientId, Client>>,
    next_id: AtomicU64,
    write_timeout: Duration,
}

impl Default for AlertServer {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertServer {
    pub fn new() -> Self {
        Self::with_write_timeout(WRITE_TIMEOUT)
    }

    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            write_timeout,
        }
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<ClientId, Client>> {
        // A panic cannot leave the map half-updated.
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client_count(&self) -> usize {
        self.lock_clients().len()
    }

    pub fn register(&self, sink: ClientSink) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Client {
            sink: Arc::new(AsyncMutex::new(sink)),
            reader: None,
        };
        self.lock_clients().insert(id, client);
        id
    }

    /// Ties a reader task to a registered subscriber so eviction can stop it.
    fn attach_reader(&self, id: ClientId, reader: AbortHandle) {
        match self.lock_clients().get_mut(&id) {
            Some(client) => client.reader = Some(reader),
            // The reader already saw the hang-up and removed the entry.
            None => reader.abort(),
        }
    }

    /// Drops a subscriber whose write failed or stalled. Both socket halves are
    /// released without waiting on the peer, which closes the connection.
    fn evict(&self, id: ClientId) {
        let removed = self.lock_clients().remove(&id);
        if let Some(client) = removed {
            if let Some(reader) = client.reader {
                reader.abort();
            }
        }
    }

    /// Removes a subscriber that hung up and completes the closing handshake.
    async fn disconnect(&self, id: ClientId) {
        let removed = self.lock_clients().remove(&id);
        if let Some(client) = removed {
            let sink = client.sink;
            let closed = timeout(self.write_timeout, async move {
                let mut sink = sink.lock().await;
                sink.close().await
            })
            .await;
            if let Ok(Err(e)) = closed {
                debug!("Subscriber {} close failed: {}", id, e);
            }
        }
    }

    /// Sends `alert` to every registered subscriber and returns how many received it.
    /// Subscribers whose write fails or times out are dropped.
    pub async fn broadcast(&self, alert: &Alert) -> Result<usize, PriceWatchError> {
        let payload = serde_json::to_string(alert)?;

        let clients: Vec<(ClientId, SharedSink)> = {
            let clients = self.lock_clients();
            clients
                .iter()
                .map(|(id, client)| (*id, Arc::clone(&client.sink)))
                .collect()
        };

        let write_timeout = self.write_timeout;
        let writes = clients.into_iter().map(|(id, sink)| {
            let message = Message::Text(payload.clone());
            async move {
                let result = timeout(write_timeout, async move {
                    let mut sink = sink.lock().await;
                    sink.send(message).await
                })
                .await;
                (id, result)
            }
        });

        let mut delivered = 0;
        for (id, result) in join_all(writes).await {
            match result {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!("Dropping subscriber {}: write failed: {}", id, e);
                    self.evict(id);
                }
                Err(_) => {
                    warn!("Dropping subscriber {}: write timed out", id);
                    self.evict(id);
                }
            }
        }

        Ok(delivered)
    }

    /// Republishes alerts until the stream closes or shutdown fires.
    pub async fn run_broadcast(&self, mut alerts: mpsc::Receiver<Alert>, mut shutdown: Shutdown) {
        loop {
            let alert = tokio::select! {
                _ = shutdown.cancelled() => break,
                alert = alerts.recv() => match alert {
                    Some(alert) => alert,
                    None => break,
                },
            };

            match self.broadcast(&alert).await {
                Ok(delivered) => debug!(
                    "Alert for {} delivered to {} subscribers",
                    alert.symbol, delivered
                ),
                Err(e) => error!("Failed to encode alert for {}: {}", alert.symbol, e),
            }
        }
        info!("Alert broadcast stopped");
    }

    /// Accepts subscribers until shutdown. In-flight handshakes get a grace period;
    /// connections already registered are left open.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: Shutdown,
    ) -> Result<(), PriceWatchError> {
        info!("Alert server listening on {}", listener.local_addr()?);

        let mut handshakes = JoinSet::new();
        let mut accept_backoff = Backoff::new(ACCEPT_RETRY_BASE, ACCEPT_RETRY_MAX);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        accept_backoff.reset();
                        handshakes.spawn(Arc::clone(&self).handshake(stream, peer));
                    }
                    Err(e) => {
                        let delay = accept_backoff.next_delay();
                        warn!(
                            "Failed to accept subscriber connection: {}; retrying in {:?}",
                            e, delay
                        );
                        if !pause(delay, &mut shutdown).await {
                            break;
                        }
                    }
                },
            }
        }
        drop(listener);

        let drained = timeout(SHUTDOWN_GRACE, async {
            while handshakes.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Abandoning {} handshakes after shutdown grace period",
                handshakes.len()
            );
            handshakes.abort_all();
        }

        info!("Alert server stopped");
        Ok(())
    }

    async fn handshake(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ws_stream = match timeout(HANDSHAKE_TIMEOUT, accept_async(stream)).await {
            Ok(Ok(ws_stream)) => ws_stream,
            Ok(Err(e)) => {
                warn!("WebSocket handshake with {} failed: {}", peer, e);
                return;
            }
            Err(_) => {
                warn!("WebSocket handshake with {} timed out", peer);
                return;
            }
        };

        let (sink, stream) = ws_stream.split();
        let id = self.register(Box::pin(sink));
        info!("Subscriber {} connected from {}", id, peer);
        let reader = tokio::spawn(watch_disconnect(Arc::clone(&self), id, stream));
        self.attach_reader(id, reader.abort_handle());
    }
}

/// Sleeps for `delay`. Returns `false` if shutdown fired first.
async fn pause(delay: Duration, shutdown: &mut Shutdown) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Subscribers never send anything meaningful; reading only detects hang-ups.
async fn watch_disconnect<S>(server: Arc<AlertServer>, id: ClientId, mut stream: S)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Subscriber {} read failed: {}", id, e);
                break;
            }
        }
    }
    server.disconnect(id).await;
    info!("Subscriber {} disconnected", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use chrono::{TimeZone, Utc};
    use tokio_tungstenite::connect_async;

    const WAIT: Duration = Duration::from_secs(5);

    fn alert() -> Alert {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        Alert {
            symbol: "BTCUSDT".into(),
            old_price: 100.0,
            new_price: 102.0,
            change: 2.0,
            change_pct: 2.0,
            occurred_at: at,
            observation: at,
        }
    }

    fn failing_sink() -> ClientSink {
        Box::pin(futures::sink::unfold((), |(), _message: Message| async {
            Err::<(), _>(tungstenite::Error::ConnectionClosed)
        }))
    }

    fn hanging_sink() -> ClientSink {
        Box::pin(futures::sink::unfold((), |(), _message: Message| {
            futures::future::pending::<Result<(), tungstenite::Error>>()
        }))
    }

    fn channel_sink() -> (ClientSink, futures::channel::mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let sink = tx.sink_map_err(|_| tungstenite::Error::ConnectionClosed);
        (Box::pin(sink), rx)
    }

    async fn wait_for_clients(server: &AlertServer, expected: usize) {
        timeout(WAIT, async {
            while server.client_count() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {} subscribers", expected));
    }

    #[tokio::test]
    async fn failed_subscriber_does_not_affect_others() {
        let server = AlertServer::new();
        let (healthy, mut received) = channel_sink();
        server.register(failing_sink());
        server.register(healthy);
        assert_eq!(server.client_count(), 2);

        let delivered = server.broadcast(&alert()).await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(server.client_count(), 1);

        match received.next().await {
            Some(Message::Text(text)) => assert!(text.contains("\"symbol\":\"BTCUSDT\"")),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn stalled_subscriber_is_dropped_after_timeout() {
        let server = AlertServer::with_write_timeout(Duration::from_millis(50));
        let (healthy, mut received) = channel_sink();
        server.register(hanging_sink());
        server.register(healthy);

        let delivered = timeout(WAIT, server.broadcast(&alert()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(server.client_count(), 1);
        assert!(received.next().await.is_some());
    }

    #[tokio::test]
    async fn stalled_subscribers_are_dropped_together() {
        let write_timeout = Duration::from_millis(100);
        let server = AlertServer::with_write_timeout(write_timeout);
        for _ in 0..5 {
            server.register(hanging_sink());
        }

        let started = std::time::Instant::now();
        assert_eq!(server.broadcast(&alert()).await.unwrap(), 0);
        assert!(
            started.elapsed() < write_timeout * 3,
            "broadcast took {:?}",
            started.elapsed()
        );
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn evict_stops_the_reader_task() {
        let server = AlertServer::new();
        let id = server.register(hanging_sink());
        let reader = tokio::spawn(futures::future::pending::<()>());
        server.attach_reader(id, reader.abort_handle());

        server.evict(id);
        let joined = timeout(WAIT, reader).await.unwrap();
        assert!(joined.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn reader_attached_after_removal_is_stopped() {
        let server = AlertServer::new();
        let id = server.register(hanging_sink());
        server.evict(id);

        let reader = tokio::spawn(futures::future::pending::<()>());
        server.attach_reader(id, reader.abort_handle());
        let joined = timeout(WAIT, reader).await.unwrap();
        assert!(joined.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn accept_retry_pause_stops_on_shutdown() {
        let (trigger, mut shutdown) = shutdown::channel();
        assert!(pause(Duration::from_millis(1), &mut shutdown).await);

        trigger.trigger();
        let paused = timeout(
            Duration::from_millis(500),
            pause(Duration::from_secs(60), &mut shutdown),
        )
        .await;
        assert_eq!(paused.ok(), Some(false));
    }

    #[tokio::test]
    async fn stalled_websocket_subscriber_is_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(AlertServer::with_write_timeout(Duration::from_millis(200)));
        let (trigger, shutdown) = shutdown::channel();
        tokio::spawn(Arc::clone(&server).run(listener, shutdown));

        // Never polled until eviction, so the server's socket buffers fill up.
        let (mut stalled, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_clients(&server, 1).await;

        let mut large = alert();
        large.symbol = "X".repeat(64 * 1024);
        let evicted = timeout(Duration::from_secs(30), async {
            while server.client_count() > 0 {
                server.broadcast(&large).await.unwrap();
            }
        })
        .await;
        assert!(evicted.is_ok(), "stalled subscriber was never dropped");

        // After the buffered frames, the server side must be gone.
        let drained = timeout(WAIT, async {
            while let Some(message) = stalled.next().await {
                if message.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(drained.is_ok(), "dropped subscriber's socket is still open");

        trigger.trigger();
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_delivers_nothing() {
        let server = AlertServer::new();
        assert_eq!(server.broadcast(&alert()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_broadcast_forwards_until_stream_closes() {
        let server = AlertServer::new();
        let (healthy, mut received) = channel_sink();
        server.register(healthy);

        let (_trigger, shutdown) = shutdown::channel();
        let (tx, rx) = mpsc::channel(4);
        tx.send(alert()).await.unwrap();
        tx.send(alert()).await.unwrap();
        drop(tx);

        timeout(WAIT, server.run_broadcast(rx, shutdown)).await.unwrap();
        assert!(received.next().await.is_some());
        assert!(received.next().await.is_some());
    }

    #[tokio::test]
    async fn serves_websocket_subscribers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(AlertServer::new());
        let (trigger, shutdown) = shutdown::channel();
        let running = tokio::spawn(Arc::clone(&server).run(listener, shutdown));

        let url = format!("ws://{}/ws", addr);
        let (mut first, _) = connect_async(url.as_str()).await.unwrap();
        let (mut second, _) = connect_async(url.as_str()).await.unwrap();
        wait_for_clients(&server, 2).await;

        assert_eq!(server.broadcast(&alert()).await.unwrap(), 2);
        for client in [&mut first, &mut second] {
            let message = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
            let value: serde_json::Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
            assert_eq!(value["symbol"], "BTCUSDT");
            assert_eq!(value["oldPrice"], 100.0);
            assert_eq!(value["changePct"], 2.0);
        }

        first.close(None).await.unwrap();
        wait_for_clients(&server, 1).await;

        trigger.trigger();
        timeout(WAIT, running).await.unwrap().unwrap().unwrap();

        // Registered subscribers outlive the accept loop.
        assert_eq!(server.broadcast(&alert()).await.unwrap(), 1);
        assert!(timeout(WAIT, second.next()).await.unwrap().is_some());
    }
}
