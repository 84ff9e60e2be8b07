use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::backend::{BrokerChannel, CloseReason, Transport};
use crate::types::ConnectionState;
use crate::{QueueError, QueueResult};

/// Owns the single broker connection and its channel.
///
/// Every topology, publish and consume call goes through [`BrokerConnection::channel`].
/// When the broker closes the connection a monitor task retries on a fixed
/// delay until it gets a new channel; each successful open bumps the epoch so
/// consumers can tell a fresh channel from the one they lost.
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    transport: Arc<dyn Transport>,
    url: Option<String>,
    prefetch: u16,
    reconnect_delay: Duration,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    epoch: AtomicU64,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerConnection {
    pub fn new(
        transport: Arc<dyn Transport>,
        url: Option<String>,
        prefetch: u16,
        reconnect_delay: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                url: url.filter(|url| !url.trim().is_empty()),
                prefetch,
                reconnect_delay,
                channel: RwLock::new(None),
                state_tx,
                shutdown_tx,
                epoch: AtomicU64::new(0),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Open the connection and channel, then watch for broker-side closes.
    ///
    /// Without a URL this logs and returns `Ok`, leaving the queue disabled.
    #[instrument(skip(self), fields(transport = self.inner.transport.name()))]
    pub async fn connect(&self) -> QueueResult<()> {
        let Some(url) = self.inner.url.clone() else {
            info!("No broker URL configured, job queue disabled");
            return Ok(());
        };

        if self.is_connected() {
            debug!("Broker connection already open");
            return Ok(());
        }

        self.inner.shutdown_tx.send_replace(false);
        self.inner.set_state(ConnectionState::Connecting);

        let channel = match self.inner.open(&url).await {
            Ok(channel) => channel,
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                warn!("Failed to connect to broker: {}", e);
                return Err(e);
            }
        };

        self.inner.install(channel.clone());
        info!(epoch = self.epoch(), "Connected to broker");

        let inner = self.inner.clone();
        let monitor = tokio::spawn(inner.monitor(url, channel).in_current_span());
        if let Some(previous) = self.inner.monitor.lock().replace(monitor) {
            previous.abort();
        }

        Ok(())
    }

    /// Close the channel, then the connection. Close errors are logged, not returned.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        self.inner.shutdown_tx.send_replace(true);

        let monitor = self.inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        let channel = self.inner.channel.write().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!("Error closing broker channel: {}", e);
            }
        }

        if self.state() != ConnectionState::Disconnected {
            self.inner.set_state(ConnectionState::Disconnected);
            info!("Disconnected from broker");
        }
    }

    /// The live channel, or `BrokerUnavailable`
    pub fn channel(&self) -> QueueResult<Arc<dyn BrokerChannel>> {
        match self.inner.channel.read().as_ref() {
            Some(channel) if channel.is_open() => Ok(channel.clone()),
            Some(_) => Err(QueueError::BrokerUnavailable(
                "broker connection lost, reconnecting".to_string(),
            )),
            None => Err(QueueError::BrokerUnavailable(
                "not connected to a broker".to_string(),
            )),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .channel
            .read()
            .as_ref()
            .map(|channel| channel.is_open())
            .unwrap_or(false)
    }

    /// A broker URL was configured
    pub fn is_configured(&self) -> bool {
        self.inner.url.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of channels opened so far; increases on every (re)connect
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Resolve once a channel newer than `epoch` is live.
    /// Returns `None` if the connection is shut down first.
    pub async fn wait_for_epoch_after(&self, epoch: u64) -> Option<u64> {
        let mut state = self.subscribe();
        let mut shutdown = self.inner.shutdown_tx.subscribe();

        tokio::select! {
            result = state.wait_for(|s| s.is_connected() && self.epoch() > epoch) => {
                result.ok().map(|_| self.epoch())
            }
            _ = shutdown.wait_for(|closing| *closing) => None,
        }
    }

    pub fn prefetch(&self) -> u16 {
        self.inner.prefetch
    }

    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }
}

impl ConnectionInner {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn closing(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    async fn open(&self, url: &str) -> QueueResult<Arc<dyn BrokerChannel>> {
        let channel = self.transport.connect(url).await?;
        if let Err(e) = channel.basic_qos(self.prefetch).await {
            let _ = channel.close().await;
            return Err(e);
        }
        Ok(channel)
    }

    /// Publish a fresh channel: slot first, then epoch, then state
    fn install(&self, channel: Arc<dyn BrokerChannel>) {
        *self.channel.write() = Some(channel);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
    }

    async fn monitor(self: Arc<Self>, url: String, mut channel: Arc<dyn BrokerChannel>) {
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            let reason = tokio::select! {
                reason = channel.wait_closed() => reason,
                _ = shutdown.wait_for(|closing| *closing) => return,
            };

            if reason == CloseReason::Requested || self.closing() {
                return;
            }

            let CloseReason::Broker(cause) = reason else {
                return;
            };
            warn!(cause = %cause, "Broker connection lost, reconnecting in {:?}", self.reconnect_delay);
            *self.channel.write() = None;
            self.set_state(ConnectionState::Reconnecting);

            channel = loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.reconnect_delay) => {}
                    _ = shutdown.wait_for(|closing| *closing) => return,
                }

                self.set_state(ConnectionState::Connecting);
                match self.open(&url).await {
                    Ok(fresh) if self.closing() => {
                        let _ = fresh.close().await;
                        return;
                    }
                    Ok(fresh) => break fresh,
                    Err(e) => {
                        warn!("Reconnect attempt failed: {}", e);
                        self.set_state(ConnectionState::Reconnecting);
                    }
                }
            };

            self.install(channel.clone());
            info!(epoch = self.epoch.load(Ordering::SeqCst), "Reconnected to broker");
        }
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBroker;
    use tracing_test::traced_test;

    fn connection(broker: &MemoryBroker, url: Option<&str>) -> BrokerConnection {
        BrokerConnection::new(
            Arc::new(broker.clone()),
            url.map(str::to_string),
            1,
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_url_is_degraded_not_fatal() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, None);

        conn.connect().await.unwrap();

        assert!(!conn.is_configured());
        assert!(!conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(conn.channel(), Err(QueueError::BrokerUnavailable(_))));
        assert!(logs_contain("No broker URL configured"));
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, Some("memory://local"));

        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.epoch(), 1);
        assert_eq!(broker.connection_count(), 1);

        // second connect is a no-op
        conn.connect().await.unwrap();
        assert_eq!(broker.connection_count(), 1);

        conn.disconnect().await;
        assert!(!conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_connect_is_reported() {
        let broker = MemoryBroker::new();
        broker.set_accepting(false);
        let conn = connection(&broker, Some("memory://local"));

        let result = conn.connect().await;
        assert!(matches!(result, Err(QueueError::BrokerUnavailable(_))));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_reconnects_after_broker_close() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, Some("memory://local"));
        conn.connect().await.unwrap();

        broker.set_accepting(false);
        broker.sever_connections("broker restart");

        let mut states = conn.subscribe();
        states
            .wait_for(|s| *s != ConnectionState::Connected)
            .await
            .unwrap();
        assert!(matches!(conn.channel(), Err(QueueError::BrokerUnavailable(_))));

        // a refused attempt keeps retrying
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!conn.is_connected());

        broker.set_accepting(true);
        let epoch = tokio::time::timeout(Duration::from_secs(2), conn.wait_for_epoch_after(1))
            .await
            .unwrap();
        assert_eq!(epoch, Some(2));
        assert!(conn.is_connected());
        assert!(logs_contain("Broker connection lost"));
        assert!(logs_contain("Reconnected to broker"));

        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_releases_epoch_waiters() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, Some("memory://local"));
        conn.connect().await.unwrap();

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.wait_for_epoch_after(1).await })
        };
        tokio::task::yield_now().await;
        conn.disconnect().await;

        assert_eq!(waiter.await.unwrap(), None);
    }
}
