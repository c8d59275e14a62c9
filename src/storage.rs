use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::types::Sample;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS samples (
    id INTEGER PRIMARY KEY,
    timestamp TEXT NOT NULL,
    value REAL NOT NULL,
    marked INTEGER NOT NULL DEFAULT 0
)";

/// Samples handed out for one upload attempt, with the row ids that identify
/// them for a rollback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkedBatch {
    pub ids: Vec<i64>,
    pub samples: Vec<Sample>,
}

/// Channel buffer of samples awaiting upload.
///
/// Samples handed out by [`SampleBuffer::mark_pending`] stay in the table with
/// their `marked` flag set until the upload outcome is known: [`purge`] drops
/// them for good, [`undelete`] makes the rows of one batch pending again.
/// Each of these runs as one transaction under the connection mutex, so
/// producers calling [`push`] never observe a half-marked batch.
///
/// [`purge`]: SampleBuffer::purge
/// [`undelete`]: SampleBuffer::undelete
/// [`push`]: SampleBuffer::push
#[derive(Debug)]
pub struct SampleBuffer {
    conn: Mutex<Connection>,
}

impl SampleBuffer {
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening sample buffer");
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves sqlite consistent; keep going.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, sample: &Sample) -> rusqlite::Result<()> {
        debug!(timestamp = %sample.timestamp, value = sample.value, "Appending sample");
        self.lock().execute(
            "INSERT INTO samples (timestamp, value) VALUES (?1, ?2)",
            params![sample.timestamp, sample.value],
        )?;
        Ok(())
    }

    /// Returns every unmarked sample, oldest first, and marks them for
    /// deletion in the same transaction.
    pub fn mark_pending(&self) -> rusqlite::Result<MarkedBatch> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mut batch = MarkedBatch::default();
        {
            let mut stmt =
                tx.prepare("SELECT id, timestamp, value FROM samples WHERE marked = 0 ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    Sample {
                        timestamp: row.get(1)?,
                        value: row.get(2)?,
                    },
                ))
            })?;
            for row in rows {
                let (id, sample) = row?;
                batch.ids.push(id);
                batch.samples.push(sample);
            }

            let mut mark = tx.prepare("UPDATE samples SET marked = 1 WHERE id = ?1")?;
            for id in &batch.ids {
                mark.execute(params![id])?;
            }
        }
        tx.commit()?;

        debug!(count = batch.ids.len(), "Marked samples for deletion");
        Ok(batch)
    }

    /// Rolls back the pending deletions of the given rows. Rows marked by
    /// other batches keep their mark. Returns the number of restored samples.
    pub fn undelete(&self, ids: &[i64]) -> rusqlite::Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mut restored = 0;
        {
            let mut stmt = tx.prepare("UPDATE samples SET marked = 0 WHERE id = ?1 AND marked = 1")?;
            for id in ids {
                restored += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;

        debug!(restored, "Rolled back pending deletions");
        Ok(restored)
    }

    /// Makes every pending deletion permanent, including rows left marked by
    /// an earlier accepted upload whose purge failed.
    pub fn purge(&self) -> rusqlite::Result<usize> {
        let removed = self.lock().execute("DELETE FROM samples WHERE marked = 1", [])?;
        debug!(removed, "Purged uploaded samples");
        Ok(removed)
    }

    /// Number of samples not yet handed out for upload.
    pub fn pending_len(&self) -> rusqlite::Result<usize> {
        self.count("SELECT COUNT(*) FROM samples WHERE marked = 0")
    }

    /// Number of samples in the table, marked or not.
    pub fn len(&self) -> rusqlite::Result<usize> {
        self.count("SELECT COUNT(*) FROM samples")
    }

    pub fn is_empty(&self) -> rusqlite::Result<bool> {
        Ok(self.len()? == 0)
    }

    fn count(&self, sql: &str) -> rusqlite::Result<usize> {
        let n: i64 = self.lock().query_row(sql, [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
