//! Build request queue.
//!
//! Producers hand content hashes to a [`BuildQueue`], which owns the only
//! broker channel in a background task. That task retries every message until
//! the broker takes it, reconnecting and re-declaring the durable queue after
//! connection failures. Producers only ever wait on a bounded buffer.

pub mod sqlite;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::model::ContentHash;

pub use sqlite::{BrokerConsumer, Delivery, SqliteBroker};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("broker connection lost: {0}")]
    ConnectionClosed(String),
    #[error("broker rejected operation: {0}")]
    Broker(String),
    /// The pending buffer stayed full, or the publisher is gone.
    #[error("{0}")]
    Unavailable(String),
}

impl QueueError {
    /// Errors after which the channel must be reopened.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, QueueError::ConnectionClosed(_))
    }
}

#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, QueueError>;

    /// Bodies of the messages currently stored in `queue`, leased or not.
    /// Brokers that cannot be inspected report none.
    async fn stored_bodies(&self, _queue: &str) -> Result<Vec<Vec<u8>>, QueueError> {
        Ok(Vec::new())
    }
}

#[async_trait]
pub trait BrokerChannel: Send {
    async fn declare_queue(&mut self, name: &str, durable: bool) -> Result<(), QueueError>;
    async fn publish(&mut self, queue: &str, body: &[u8]) -> Result<(), QueueError>;
}

/// Anything that can take a build request. Implemented by [`BuildQueue`];
/// tests substitute recording fakes.
#[async_trait]
pub trait BuildPublisher: Send + Sync {
    async fn publish(&self, hash: &ContentHash) -> Result<(), QueueError>;

    /// Hashes whose build request is already waiting in the broker.
    async fn queued(&self) -> Result<HashSet<ContentHash>, QueueError> {
        Ok(HashSet::new())
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub queue_name: String,
    pub retry_delay: Duration,
    pub pending_capacity: usize,
    pub enqueue_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for QueueSettings {
    fn from(cfg: &QueueConfig) -> Self {
        Self {
            queue_name: cfg.queue_name.clone(),
            retry_delay: cfg.retry_delay(),
            pending_capacity: cfg.pending_capacity.max(1),
            enqueue_timeout: cfg.enqueue_timeout(),
        }
    }
}

pub struct BuildQueue {
    tx: Mutex<Option<mpsc::Sender<ContentHash>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    connector: Arc<dyn BrokerConnector>,
    settings: QueueSettings,
}

impl BuildQueue {
    /// Spawns the publisher task on the current tokio runtime.
    pub fn start(connector: Arc<dyn BrokerConnector>, settings: QueueSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.pending_capacity.max(1));
        let worker = tokio::spawn(run_publisher(connector.clone(), settings.clone(), rx));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            connector,
            settings,
        }
    }

    /// Messages accepted but not yet handed to the broker.
    pub fn pending(&self) -> usize {
        match self.tx.lock() {
            Ok(guard) => guard
                .as_ref()
                .map(|tx| tx.max_capacity() - tx.capacity())
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Accepts `hash` for delivery. Fails with `Unavailable` if the buffer
    /// stays full for `enqueue_timeout` or the queue is shut down.
    pub async fn enqueue(&self, hash: &ContentHash) -> Result<(), QueueError> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| QueueError::Unavailable("build queue lock poisoned".into()))?
            .clone()
            .ok_or_else(|| QueueError::Unavailable("build queue is shut down".into()))?;

        match tx.send_timeout(hash.clone(), self.settings.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(
                    event = "queue.backpressure",
                    hash = %hash,
                    capacity = self.settings.pending_capacity,
                );
                Err(QueueError::Unavailable(
                    "build queue pending buffer is full".into(),
                ))
            }
            Err(SendTimeoutError::Closed(_)) => Err(QueueError::Unavailable(
                "build queue publisher has stopped".into(),
            )),
        }
    }

    /// Stops accepting messages and waits up to `grace` for the buffer to drain.
    /// Returns false if messages were still pending when the grace period ended.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let pending = self.pending();
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let worker = match self.worker.lock() {
            Ok(mut w) => w.take(),
            Err(_) => None,
        };
        let Some(mut worker) = worker else {
            return true;
        };
        match tokio::time::timeout(grace, &mut worker).await {
            Ok(_) => true,
            Err(_) => {
                worker.abort();
                tracing::warn!(event = "queue.shutdown_incomplete", pending);
                false
            }
        }
    }
}

#[async_trait]
impl BuildPublisher for BuildQueue {
    async fn publish(&self, hash: &ContentHash) -> Result<(), QueueError> {
        self.enqueue(hash).await
    }

    async fn queued(&self) -> Result<HashSet<ContentHash>, QueueError> {
        let bodies = self.connector.stored_bodies(&self.settings.queue_name).await?;
        Ok(bodies
            .iter()
            .filter_map(|b| std::str::from_utf8(b).ok())
            .filter_map(|s| ContentHash::parse(s).ok())
            .collect())
    }
}

async fn open_channel(
    connector: &dyn BrokerConnector,
    queue_name: &str,
) -> Result<Box<dyn BrokerChannel>, QueueError> {
    let mut channel = connector.connect().await?;
    channel.declare_queue(queue_name, true).await?;
    Ok(channel)
}

async fn run_publisher(
    connector: Arc<dyn BrokerConnector>,
    settings: QueueSettings,
    mut rx: mpsc::Receiver<ContentHash>,
) {
    let mut channel: Option<Box<dyn BrokerChannel>> = None;

    while let Some(hash) = rx.recv().await {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;

            if channel.is_none() {
                match open_channel(connector.as_ref(), &settings.queue_name).await {
                    Ok(ch) => {
                        tracing::info!(event = "queue.connected", queue = %settings.queue_name);
                        channel = Some(ch);
                    }
                    Err(e) => {
                        tracing::warn!(event = "queue.connect_failed", attempt, error = %e);
                        tokio::time::sleep(settings.retry_delay).await;
                        continue;
                    }
                }
            }
            let Some(ch) = channel.as_mut() else {
                continue;
            };

            match ch
                .publish(&settings.queue_name, hash.as_str().as_bytes())
                .await
            {
                Ok(()) => {
                    tracing::info!(event = "queue.published", hash = %hash, attempt);
                    break;
                }
                Err(e) if e.is_connection_level() => {
                    tracing::warn!(event = "queue.reconnecting", hash = %hash, attempt, error = %e);
                    channel = None;
                }
                Err(e) => {
                    tracing::warn!(event = "queue.publish_failed", hash = %hash, attempt, error = %e);
                }
            }
            tokio::time::sleep(settings.retry_delay).await;
        }
    }
    tracing::debug!(event = "queue.publisher_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorded {
        connects: AtomicUsize,
        bodies: Mutex<Vec<Vec<u8>>>,
    }

    struct OkConnector(Arc<Recorded>);
    struct OkChannel(Arc<Recorded>);

    #[async_trait]
    impl BrokerConnector for OkConnector {
        async fn connect(&self) -> Result<Box<dyn BrokerChannel>, QueueError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(OkChannel(self.0.clone())))
        }
    }

    #[async_trait]
    impl BrokerChannel for OkChannel {
        async fn declare_queue(&mut self, _name: &str, durable: bool) -> Result<(), QueueError> {
            assert!(durable);
            Ok(())
        }
        async fn publish(&mut self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
            assert_eq!(queue, "build_queue");
            self.0.bodies.lock().unwrap().push(body.to_vec());
            Ok(())
        }
    }

    fn hash(c: char) -> ContentHash {
        ContentHash::parse(&c.to_string().repeat(64)).unwrap()
    }

    #[tokio::test]
    async fn test_publishes_hash_body_over_one_connection() {
        let rec = Arc::new(Recorded::default());
        let q = BuildQueue::start(Arc::new(OkConnector(rec.clone())), QueueSettings::default());
        q.publish(&hash('a')).await.unwrap();
        q.publish(&hash('b')).await.unwrap();
        assert!(q.shutdown(Duration::from_secs(5)).await);

        let bodies = rec.bodies.lock().unwrap().clone();
        assert_eq!(
            bodies,
            vec![
                hash('a').as_str().as_bytes().to_vec(),
                hash('b').as_str().as_bytes().to_vec()
            ]
        );
        assert_eq!(rec.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_unavailable() {
        let rec = Arc::new(Recorded::default());
        let q = BuildQueue::start(Arc::new(OkConnector(rec)), QueueSettings::default());
        q.shutdown(Duration::from_secs(1)).await;
        assert!(matches!(
            q.enqueue(&hash('c')).await,
            Err(QueueError::Unavailable(_))
        ));
    }

    #[test]
    fn test_connection_level_classification() {
        assert!(QueueError::ConnectionClosed("eof".into()).is_connection_level());
        assert!(!QueueError::Broker("precondition".into()).is_connection_level());
        assert!(!QueueError::Unavailable("full".into()).is_connection_level());
    }
}
