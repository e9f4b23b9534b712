//! Durable broker kept in its own SQLite file.
//!
//! Messages survive restarts of producer and consumer. Delivery is
//! at-least-once: a received message is leased, and comes back if it is
//! neither acked nor nacked before the lease runs out.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};

use super::{BrokerChannel, BrokerConnector, QueueError};
use crate::model::ContentHash;

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS queues (
  name TEXT PRIMARY KEY,
  durable INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  queue TEXT NOT NULL REFERENCES queues(name),
  body BLOB NOT NULL,
  enqueued_at TEXT NOT NULL,
  leased_until INTEGER,
  deliveries INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_messages_queue ON messages(queue, id);
"#;

fn map_err(e: rusqlite::Error) -> QueueError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            QueueError::Broker(e.to_string())
        }
        _ => QueueError::ConnectionClosed(e.to_string()),
    }
}

fn open(path: &Path) -> Result<Connection, QueueError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            QueueError::ConnectionClosed(format!("cannot create {}: {}", parent.display(), e))
        })?;
    }
    let conn = Connection::open(path).map_err(map_err)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        .map_err(map_err)?;
    conn.busy_timeout(Duration::from_secs(5)).map_err(map_err)?;
    conn.execute_batch(DDL).map_err(map_err)?;
    Ok(conn)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Connector for the SQLite broker file at `path`.
#[derive(Debug, Clone)]
pub struct SqliteBroker {
    path: PathBuf,
}

impl SqliteBroker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn consumer(&self) -> Result<BrokerConsumer, QueueError> {
        Ok(BrokerConsumer {
            conn: open(&self.path)?,
        })
    }
}

#[async_trait]
impl BrokerConnector for SqliteBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, QueueError> {
        let path = self.path.clone();
        let conn = blocking(move || open(&path)).await?;
        Ok(Box::new(SqliteChannel {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }

    async fn stored_bodies(&self, queue: &str) -> Result<Vec<Vec<u8>>, QueueError> {
        let broker = self.clone();
        let queue = queue.to_string();
        blocking(move || broker.consumer()?.bodies(&queue)).await
    }
}

/// SQLite calls wait on the busy timeout while another process writes, so
/// they run on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, QueueError>
where
    F: FnOnce() -> Result<T, QueueError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| QueueError::ConnectionClosed(format!("broker task failed: {e}")))?
}

struct SqliteChannel {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteChannel {
    async fn with_conn<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(&Connection) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| QueueError::ConnectionClosed("broker connection poisoned".into()))?;
            f(&conn)
        })
        .await
    }
}

#[async_trait]
impl BrokerChannel for SqliteChannel {
    async fn declare_queue(&mut self, name: &str, durable: bool) -> Result<(), QueueError> {
        let name = name.to_string();
        self.with_conn(move |conn| declare(conn, &name, durable)).await
    }

    async fn publish(&mut self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        let queue = queue.to_string();
        let body = body.to_vec();
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "INSERT INTO messages (queue, body, enqueued_at, deliveries)
                     SELECT ?1, ?2, ?3, 0 WHERE EXISTS (SELECT 1 FROM queues WHERE name = ?1)",
                    params![queue, body, Utc::now().to_rfc3339()],
                )
                .map_err(map_err)?;
            if n == 0 {
                return Err(QueueError::Broker(format!("queue {queue:?} is not declared")));
            }
            Ok(())
        })
        .await
    }
}

fn declare(conn: &Connection, name: &str, durable: bool) -> Result<(), QueueError> {
    conn.execute(
        "INSERT INTO queues (name, durable) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
        params![name, durable],
    )
    .map_err(map_err)?;
    let existing: bool = conn
        .query_row(
            "SELECT durable FROM queues WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .map_err(map_err)?;
    if existing != durable {
        return Err(QueueError::Broker(format!(
            "queue {name:?} already declared with durable={existing}"
        )));
    }
    Ok(())
}

/// A leased message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub body: Vec<u8>,
    /// 1 on first delivery.
    pub deliveries: u32,
}

impl Delivery {
    pub fn content_hash(&self) -> Option<ContentHash> {
        std::str::from_utf8(&self.body)
            .ok()
            .and_then(|s| ContentHash::parse(s).ok())
    }

    pub fn is_redelivery(&self) -> bool {
        self.deliveries > 1
    }
}

/// Consumer side of the SQLite broker, used by builders.
pub struct BrokerConsumer {
    conn: Connection,
}

impl BrokerConsumer {
    pub fn declare_queue(&self, name: &str) -> Result<(), QueueError> {
        declare(&self.conn, name, true)
    }

    /// Leases the oldest available message for `lease`.
    pub fn receive(&mut self, queue: &str, lease: Duration) -> Result<Option<Delivery>, QueueError> {
        let now = now_ms();
        let until = now.saturating_add(lease.as_millis().min(i64::MAX as u128) as i64);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_err)?;
        let row: Option<(i64, Vec<u8>, i64)> = tx
            .query_row(
                "SELECT id, body, deliveries FROM messages
                 WHERE queue = ?1 AND (leased_until IS NULL OR leased_until <= ?2)
                 ORDER BY id ASC LIMIT 1",
                params![queue, now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(map_err)?;
        let Some((id, body, deliveries)) = row else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE messages SET leased_until = ?2, deliveries = deliveries + 1 WHERE id = ?1",
            params![id, until],
        )
        .map_err(map_err)?;
        tx.commit().map_err(map_err)?;
        Ok(Some(Delivery {
            id,
            body,
            deliveries: (deliveries + 1) as u32,
        }))
    }

    /// Removes a delivered message. False if it was already gone.
    pub fn ack(&self, id: i64) -> Result<bool, QueueError> {
        let n = self
            .conn
            .execute("DELETE FROM messages WHERE id = ?1", params![id])
            .map_err(map_err)?;
        Ok(n == 1)
    }

    /// Releases the lease so the message is delivered again right away.
    pub fn nack(&self, id: i64) -> Result<bool, QueueError> {
        let n = self
            .conn
            .execute(
                "UPDATE messages SET leased_until = NULL WHERE id = ?1",
                params![id],
            )
            .map_err(map_err)?;
        Ok(n == 1)
    }

    /// All messages in `queue`, leased or not.
    pub fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE queue = ?1",
                params![queue],
                |row| row.get(0),
            )
            .map_err(map_err)?;
        Ok(n as u64)
    }

    pub fn bodies(&self, queue: &str) -> Result<Vec<Vec<u8>>, QueueError> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM messages WHERE queue = ?1 ORDER BY id ASC")
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![queue], |row| row.get::<_, Vec<u8>>(0))
            .map_err(map_err)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(map_err)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: &str = "build_queue";

    async fn publish(broker: &SqliteBroker, body: &str) {
        let mut ch = broker.connect().await.unwrap();
        ch.declare_queue(Q, true).await.unwrap();
        ch.publish(Q, body.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_messages_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let broker = SqliteBroker::new(dir.path().join("broker.db"));
        publish(&broker, "one").await;
        publish(&broker, "two").await;

        let reopened = SqliteBroker::new(dir.path().join("broker.db"));
        let consumer = reopened.consumer().unwrap();
        assert_eq!(consumer.depth(Q).unwrap(), 2);
        assert_eq!(consumer.bodies(Q).unwrap(), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_receive_ack_nack() {
        let dir = tempfile::tempdir().unwrap();
        let broker = SqliteBroker::new(dir.path().join("broker.db"));
        publish(&broker, "first").await;
        publish(&broker, "second").await;
        let mut c = broker.consumer().unwrap();

        let a = c.receive(Q, Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(a.body, b"first");
        assert!(!a.is_redelivery());

        let b = c.receive(Q, Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(b.body, b"second");
        assert!(c.receive(Q, Duration::from_secs(60)).unwrap().is_none());

        assert!(c.nack(a.id).unwrap());
        let again = c.receive(Q, Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(again.id, a.id);
        assert!(again.is_redelivery());

        assert!(c.ack(again.id).unwrap());
        assert!(!c.ack(again.id).unwrap());
        assert_eq!(c.depth(Q).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let dir = tempfile::tempdir().unwrap();
        let broker = SqliteBroker::new(dir.path().join("broker.db"));
        publish(&broker, "job").await;
        let mut c = broker.consumer().unwrap();

        let first = c.receive(Q, Duration::ZERO).unwrap().unwrap();
        let second = c.receive(Q, Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.deliveries, 2);
    }

    #[tokio::test]
    async fn test_stored_bodies_include_leased_messages() {
        let dir = tempfile::tempdir().unwrap();
        let broker = SqliteBroker::new(dir.path().join("broker.db"));
        assert!(broker.stored_bodies(Q).await.unwrap().is_empty());
        publish(&broker, "first").await;
        publish(&broker, "second").await;
        let mut c = broker.consumer().unwrap();
        let leased = c.receive(Q, Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(leased.body, b"first");

        assert_eq!(
            broker.stored_bodies(Q).await.unwrap(),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
        assert!(broker.stored_bodies("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_requires_declared_queue() {
        let dir = tempfile::tempdir().unwrap();
        let broker = SqliteBroker::new(dir.path().join("broker.db"));
        let mut ch = broker.connect().await.unwrap();
        let err = ch.publish("nowhere", b"x").await.unwrap_err();
        assert!(matches!(err, QueueError::Broker(_)));
        assert!(!err.is_connection_level());

        ch.declare_queue("transient", false).await.unwrap();
        assert!(ch.declare_queue("transient", true).await.is_err());
    }

    #[test]
    fn test_delivery_hash() {
        let d = Delivery {
            id: 1,
            body: "ab".repeat(32).into_bytes(),
            deliveries: 1,
        };
        assert_eq!(d.content_hash().unwrap().as_str(), "ab".repeat(32));
        let bad = Delivery {
            body: b"not a hash".to_vec(),
            ..d
        };
        assert!(bad.content_hash().is_none());
    }
}
