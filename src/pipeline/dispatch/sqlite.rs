use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use super::{Delivery, DispatchError, Task, TaskQueue};
use crate::db::sqlite::{open_database, open_memory_database};
use crate::db::DatabaseError;
use crate::models::TaskReference;

/// Durable queue in the `task_queue` table.
///
/// A claimed row is leased until `locked_until`; if the worker dies before
/// acking, the row becomes visible again once the lease expires.
pub struct SqliteTaskQueue {
    conn: Mutex<Connection>,
    poll_interval: Duration,
    lease: Duration,
}

impl SqliteTaskQueue {
    pub fn open(path: &Path, poll_interval: Duration, lease: Duration) -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(open_database(path)?, poll_interval, lease))
    }

    pub fn in_memory(poll_interval: Duration, lease: Duration) -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(open_memory_database()?, poll_interval, lease))
    }

    pub fn from_connection(conn: Connection, poll_interval: Duration, lease: Duration) -> Self {
        Self {
            conn: Mutex::new(conn),
            poll_interval,
            lease,
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DispatchError> {
        self.conn
            .lock()
            .map_err(|_| DispatchError::Database(DatabaseError::LockPoisoned))
    }

    /// Claim the oldest visible row, if any.
    pub fn try_claim(&self) -> Result<Option<Delivery>, DispatchError> {
        let mut conn = self.conn()?;
        let now = now_millis();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::from)?;

        let row = {
            let mut stmt = tx
                .prepare(
                    "SELECT delivery_id, task_reference, consultation_id, attempt FROM task_queue
                     WHERE available_at <= ?1 AND (locked_until IS NULL OR locked_until <= ?1)
                     ORDER BY available_at, enqueued_at LIMIT 1",
                )
                .map_err(DatabaseError::from)?;
            let result = stmt.query_row(params![now], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            });
            match result {
                Ok(row) => Some(row),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(DatabaseError::from(e).into()),
            }
        };

        let Some((delivery_id, reference, consultation_id, attempt)) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE task_queue SET locked_until = ?2 WHERE delivery_id = ?1",
            params![delivery_id, now + self.lease.as_millis() as i64],
        )
        .map_err(DatabaseError::from)?;
        tx.commit().map_err(DatabaseError::from)?;

        Ok(Some(Delivery {
            id: parse_uuid("delivery_id", &delivery_id)?,
            task: Task {
                consultation_id: parse_uuid("consultation_id", &consultation_id)?,
                reference: TaskReference::from_str(&reference).map_err(|e| malformed("task_reference", e))?,
                attempt,
            },
        }))
    }

    /// Rows not yet acked, visible or leased.
    pub fn pending(&self) -> Result<usize, DispatchError> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM task_queue", [], |row| row.get(0))
            .map_err(DatabaseError::from)?;
        Ok(count as usize)
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<(), DispatchError> {
        let now = now_millis();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO task_queue (delivery_id, task_reference, consultation_id, attempt,
             available_at, locked_until, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)",
            params![
                Uuid::new_v4().to_string(),
                task.reference.to_string(),
                task.consultation_id.to_string(),
                task.attempt,
                now + delay.as_millis() as i64,
                now,
            ],
        )
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    async fn next(&self) -> Result<Delivery, DispatchError> {
        loop {
            if let Some(delivery) = self.try_claim()? {
                return Ok(delivery);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM task_queue WHERE delivery_id = ?1",
            params![delivery.id.to_string()],
        )
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    async fn is_pending(&self, reference: &TaskReference) -> Result<bool, DispatchError> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM task_queue WHERE task_reference = ?1 LIMIT 1",
                params![reference.to_string()],
                |_| Ok(()),
            )
            .optional()
            .map_err(DatabaseError::from)?;
        Ok(found.is_some())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn parse_uuid(column: &str, value: &str) -> Result<Uuid, DispatchError> {
    Uuid::parse_str(value).map_err(|e| malformed(column, e))
}

fn malformed(column: &str, e: impl std::fmt::Display) -> DispatchError {
    DispatchError::Database(DatabaseError::Malformed {
        column: column.into(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(lease: Duration) -> SqliteTaskQueue {
        SqliteTaskQueue::in_memory(Duration::from_millis(10), lease).unwrap()
    }

    fn task() -> Task {
        Task::first(Uuid::new_v4(), TaskReference::new())
    }

    #[tokio::test]
    async fn enqueue_claim_ack() {
        let q = queue(Duration::from_secs(60));
        let t = task();
        q.enqueue(t, Duration::ZERO).await.unwrap();

        let delivery = q.next().await.unwrap();
        assert_eq!(delivery.task, t);
        // Leased: not visible to a second consumer.
        assert!(q.try_claim().unwrap().is_none());
        assert_eq!(q.pending().unwrap(), 1);

        q.ack(&delivery).await.unwrap();
        assert_eq!(q.pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn leased_row_keeps_reference_pending() {
        let q = queue(Duration::from_secs(60));
        let t = task();
        assert!(!q.is_pending(&t.reference).await.unwrap());

        q.enqueue(t, Duration::from_secs(3600)).await.unwrap();
        assert!(q.is_pending(&t.reference).await.unwrap());

        let other = task();
        q.enqueue(other, Duration::ZERO).await.unwrap();
        let delivery = q.try_claim().unwrap().unwrap();
        assert_eq!(delivery.task, other);
        assert!(q.is_pending(&other.reference).await.unwrap());
        q.ack(&delivery).await.unwrap();
        assert!(!q.is_pending(&other.reference).await.unwrap());
        assert!(q.is_pending(&t.reference).await.unwrap());
    }

    #[tokio::test]
    async fn delayed_task_is_invisible_until_due() {
        let q = queue(Duration::from_secs(60));
        q.enqueue(task(), Duration::from_secs(3600)).await.unwrap();
        assert!(q.try_claim().unwrap().is_none());
    }

    #[tokio::test]
    async fn unacked_delivery_reappears_after_lease() {
        let q = queue(Duration::from_millis(20));
        let t = task().retry();
        q.enqueue(t, Duration::ZERO).await.unwrap();

        let first = q.try_claim().unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = q.try_claim().unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.task.attempt, 2);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let t = task();
        {
            let q = SqliteTaskQueue::open(&path, Duration::from_millis(10), Duration::from_secs(60)).unwrap();
            q.enqueue(t, Duration::ZERO).await.unwrap();
        }
        let q = SqliteTaskQueue::open(&path, Duration::from_millis(10), Duration::from_secs(60)).unwrap();
        assert_eq!(q.next().await.unwrap().task, t);
    }
}
