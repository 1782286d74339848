//! Persistence: violation ledger, vehicle owner registry and the notice job archive.
//!
//! Violations are recorded before any notice goes out, so a crash between the two leaves
//! an unprocessed row that `pending_violations` picks up on restart.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::notify::{NotificationJob, NotificationKind, Payload, PendingJob};
use crate::{now_s, open_db_connection, Violation};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViolationId(pub i64);

impl fmt::Display for ViolationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredViolation {
    pub id: ViolationId,
    pub violation: Violation,
    /// Evidence image for the notice attachment.
    pub image_path: Option<PathBuf>,
    pub processed: bool,
    /// The notice exhausted its attempts. Set until an operator reopens the violation.
    #[serde(default)]
    pub dead_lettered: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleOwner {
    pub license_plate: String,
    pub owner_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// A job that exhausted its attempts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    pub recorded_at: u64,
    pub kind: NotificationKind,
    pub payload: Payload,
    pub attempt_count: u32,
    pub error: String,
}

pub trait Ledger: Send {
    fn record_violation(&mut self, violation: &Violation, image_path: Option<&Path>)
        -> Result<ViolationId>;

    /// Fails for unknown ids.
    fn mark_processed(&mut self, id: ViolationId) -> Result<()>;

    /// Record that the violation's notice went DEAD. It stops being pending.
    fn mark_dead_lettered(&mut self, id: ViolationId) -> Result<()>;

    /// Clear the dead-lettered flag so the next resume notifies again.
    fn reopen_violation(&mut self, id: ViolationId) -> Result<()>;

    /// Violations still waiting for a notice (neither processed nor dead-lettered),
    /// oldest first.
    fn pending_violations(&mut self) -> Result<Vec<StoredViolation>>;

    fn violation(&mut self, id: ViolationId) -> Result<Option<StoredViolation>>;
}

pub trait OwnerRegistry: Send {
    /// Insert or replace the owner for `owner.license_plate`.
    fn register_owner(&mut self, owner: &VehicleOwner) -> Result<()>;

    fn owner_for_plate(&mut self, plate: &str) -> Result<Option<VehicleOwner>>;
}

pub trait JobArchive: Send {
    fn archive_dead_letter(&mut self, job: &NotificationJob, error: &str) -> Result<()>;

    /// Most recent first.
    fn dead_letters(&mut self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Persist jobs handed back by a dispatcher shutdown. Returns the number stored.
    fn stash_pending_jobs(&mut self, jobs: &[PendingJob]) -> Result<usize>;

    /// Remove and return every stashed job, in stash order.
    fn take_stashed_jobs(&mut self) -> Result<Vec<PendingJob>>;
}

/// Everything the enforcement pipeline persists.
pub trait EnforcementStore: Ledger + OwnerRegistry + JobArchive {}

impl<T: Ledger + OwnerRegistry + JobArchive> EnforcementStore for T {}

/// Plates are compared without spaces or dashes, case-insensitively.
pub fn normalize_plate(plate: &str) -> String {
    plate
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn stash_digest(payload_json: &str) -> String {
    hex::encode(Sha256::digest(payload_json.as_bytes()))
}

fn epoch_to_i64(epoch_s: u64) -> Result<i64> {
    i64::try_from(epoch_s).map_err(|_| anyhow!("timestamp exceeds i64 range"))
}

// -------------------- SQLite --------------------

pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    /// Open or create the database. `file:` URIs (see `shared_memory_uri`) are accepted.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let mut ledger = Self { conn };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS vehicle_owners (
              license_plate TEXT PRIMARY KEY,
              owner_name TEXT NOT NULL,
              email TEXT NOT NULL,
              phone TEXT,
              address TEXT
            );

            CREATE TABLE IF NOT EXISTS violations (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at INTEGER NOT NULL,
              kind TEXT NOT NULL,
              license_plate TEXT,
              payload_json TEXT NOT NULL,
              image_path TEXT,
              processed INTEGER NOT NULL DEFAULT 0,
              dead_lettered INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS dead_letters (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              recorded_at INTEGER NOT NULL,
              kind TEXT NOT NULL,
              attempt_count INTEGER NOT NULL,
              error TEXT NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_outbox (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              payload_json TEXT NOT NULL,
              digest TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_violations_processed ON violations(processed, id);
            "#,
        )?;
        self.ensure_violation_columns()?;
        Ok(())
    }

    /// Ledgers created before dead-letter tracking lack the column.
    fn ensure_violation_columns(&mut self) -> Result<()> {
        let mut stmt = self.conn.prepare("PRAGMA table_info(violations)")?;
        let mut rows = stmt.query([])?;
        let mut has_dead_lettered = false;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == "dead_lettered" {
                has_dead_lettered = true;
                break;
            }
        }
        drop(rows);
        drop(stmt);
        if !has_dead_lettered {
            self.conn.execute(
                "ALTER TABLE violations ADD COLUMN dead_lettered INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
        }
        Ok(())
    }

    fn set_dead_lettered(&mut self, id: ViolationId, value: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE violations SET dead_lettered = ?1 WHERE id = ?2",
            params![value as i64, id.0],
        )?;
        if changed == 0 {
            return Err(anyhow!("unknown violation id {}", id));
        }
        Ok(())
    }

    fn row_to_stored(
        id: i64,
        payload_json: &str,
        image_path: Option<String>,
        processed: i64,
        dead_lettered: i64,
    ) -> Result<StoredViolation> {
        let violation: Violation = serde_json::from_str(payload_json)
            .map_err(|e| anyhow!("corrupt violation row {}: {}", id, e))?;
        Ok(StoredViolation {
            id: ViolationId(id),
            violation,
            image_path: image_path.map(PathBuf::from),
            processed: processed != 0,
            dead_lettered: dead_lettered != 0,
        })
    }
}

impl Ledger for SqliteLedger {
    fn record_violation(
        &mut self,
        violation: &Violation,
        image_path: Option<&Path>,
    ) -> Result<ViolationId> {
        let created_at = epoch_to_i64(violation.created_at())?;
        let payload_json = serde_json::to_string(violation)?;
        let image = image_path.map(|p| p.to_string_lossy().into_owned());
        self.conn.execute(
            r#"
            INSERT INTO violations(created_at, kind, license_plate, payload_json, image_path)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                created_at,
                violation.kind().as_str(),
                violation.license_plate(),
                payload_json,
                image
            ],
        )?;
        Ok(ViolationId(self.conn.last_insert_rowid()))
    }

    fn mark_processed(&mut self, id: ViolationId) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE violations SET processed = 1 WHERE id = ?1",
            params![id.0],
        )?;
        if changed == 0 {
            return Err(anyhow!("unknown violation id {}", id));
        }
        Ok(())
    }

    fn mark_dead_lettered(&mut self, id: ViolationId) -> Result<()> {
        self.set_dead_lettered(id, true)
    }

    fn reopen_violation(&mut self, id: ViolationId) -> Result<()> {
        self.set_dead_lettered(id, false)
    }

    fn pending_violations(&mut self) -> Result<Vec<StoredViolation>> {
        let rows = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT id, payload_json, image_path FROM violations
                WHERE processed = 0 AND dead_lettered = 0
                ORDER BY id ASC
                "#,
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let payload: String = row.get(1)?;
                let image: Option<String> = row.get(2)?;
                out.push((id, payload, image));
            }
            out
        };
        rows.into_iter()
            .map(|(id, payload, image)| Self::row_to_stored(id, &payload, image, 0, 0))
            .collect()
    }

    fn violation(&mut self, id: ViolationId) -> Result<Option<StoredViolation>> {
        let row = self
            .conn
            .query_row(
                "SELECT payload_json, image_path, processed, dead_lettered FROM violations WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(payload, image, processed, dead)| {
            Self::row_to_stored(id.0, &payload, image, processed, dead)
        })
        .transpose()
    }
}

impl OwnerRegistry for SqliteLedger {
    fn register_owner(&mut self, owner: &VehicleOwner) -> Result<()> {
        let plate = normalize_plate(&owner.license_plate);
        if plate.is_empty() {
            return Err(anyhow!("license plate must not be empty"));
        }
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO vehicle_owners(license_plate, owner_name, email, phone, address)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                plate,
                owner.owner_name,
                owner.email,
                owner.phone,
                owner.address
            ],
        )?;
        Ok(())
    }

    fn owner_for_plate(&mut self, plate: &str) -> Result<Option<VehicleOwner>> {
        let owner = self
            .conn
            .query_row(
                "SELECT license_plate, owner_name, email, phone, address FROM vehicle_owners WHERE license_plate = ?1",
                params![normalize_plate(plate)],
                |row| {
                    Ok(VehicleOwner {
                        license_plate: row.get(0)?,
                        owner_name: row.get(1)?,
                        email: row.get(2)?,
                        phone: row.get(3)?,
                        address: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(owner)
    }
}

impl JobArchive for SqliteLedger {
    fn archive_dead_letter(&mut self, job: &NotificationJob, error: &str) -> Result<()> {
        let recorded_at = epoch_to_i64(now_s()?)?;
        let payload_json = serde_json::to_string(job.payload())?;
        self.conn.execute(
            r#"
            INSERT INTO dead_letters(recorded_at, kind, attempt_count, error, payload_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                recorded_at,
                job.kind().as_str(),
                job.attempt_count(),
                error,
                payload_json
            ],
        )?;
        Ok(())
    }

    fn dead_letters(&mut self, limit: usize) -> Result<Vec<DeadLetter>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, recorded_at, kind, attempt_count, error, payload_json FROM dead_letters ORDER BY id DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let recorded_at: i64 = row.get(1)?;
            let kind: String = row.get(2)?;
            let payload: String = row.get(5)?;
            out.push(DeadLetter {
                id,
                recorded_at: u64::try_from(recorded_at)
                    .map_err(|_| anyhow!("corrupt dead letter {}: negative timestamp", id))?,
                kind: serde_json::from_value(serde_json::Value::String(kind))
                    .map_err(|e| anyhow!("corrupt dead letter {}: {}", id, e))?,
                attempt_count: row.get(3)?,
                error: row.get(4)?,
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(out)
    }

    fn stash_pending_jobs(&mut self, jobs: &[PendingJob]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        for job in jobs {
            let payload_json = serde_json::to_string(job)?;
            tx.execute(
                "INSERT INTO job_outbox(payload_json, digest) VALUES (?1, ?2)",
                params![payload_json, stash_digest(&payload_json)],
            )?;
        }
        tx.commit()?;
        Ok(jobs.len())
    }

    fn take_stashed_jobs(&mut self) -> Result<Vec<PendingJob>> {
        let tx = self.conn.transaction()?;
        let rows = {
            let mut stmt = tx.prepare("SELECT id, payload_json, digest FROM job_outbox ORDER BY id ASC")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let payload: String = row.get(1)?;
                let digest: String = row.get(2)?;
                out.push((id, payload, digest));
            }
            out
        };
        tx.execute("DELETE FROM job_outbox", [])?;
        tx.commit()?;

        let mut jobs = Vec::with_capacity(rows.len());
        for (id, payload, digest) in rows {
            if stash_digest(&payload) != digest {
                log::warn!("stashed job row {} failed digest check; skipped", id);
                continue;
            }
            match serde_json::from_str::<PendingJob>(&payload) {
                Ok(job) => jobs.push(job),
                Err(err) => log::warn!("stashed job row {} unreadable: {}", id, err),
            }
        }
        Ok(jobs)
    }
}

// -------------------- In-memory --------------------

#[derive(Clone, Debug, Default)]
pub struct InMemoryLedger {
    next_violation: i64,
    violations: BTreeMap<i64, StoredViolation>,
    owners: BTreeMap<String, VehicleOwner>,
    dead_letters: Vec<DeadLetter>,
    outbox: Vec<PendingJob>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn stored_mut(&mut self, id: ViolationId) -> Result<&mut StoredViolation> {
        self.violations
            .get_mut(&id.0)
            .ok_or_else(|| anyhow!("unknown violation id {}", id))
    }
}

impl Ledger for InMemoryLedger {
    fn record_violation(
        &mut self,
        violation: &Violation,
        image_path: Option<&Path>,
    ) -> Result<ViolationId> {
        self.next_violation += 1;
        let id = self.next_violation;
        self.violations.insert(
            id,
            StoredViolation {
                id: ViolationId(id),
                violation: violation.clone(),
                image_path: image_path.map(Path::to_path_buf),
                processed: false,
                dead_lettered: false,
            },
        );
        Ok(ViolationId(id))
    }

    fn mark_processed(&mut self, id: ViolationId) -> Result<()> {
        self.stored_mut(id)?.processed = true;
        Ok(())
    }

    fn mark_dead_lettered(&mut self, id: ViolationId) -> Result<()> {
        self.stored_mut(id)?.dead_lettered = true;
        Ok(())
    }

    fn reopen_violation(&mut self, id: ViolationId) -> Result<()> {
        self.stored_mut(id)?.dead_lettered = false;
        Ok(())
    }

    fn pending_violations(&mut self) -> Result<Vec<StoredViolation>> {
        Ok(self
            .violations
            .values()
            .filter(|v| !v.processed && !v.dead_lettered)
            .cloned()
            .collect())
    }

    fn violation(&mut self, id: ViolationId) -> Result<Option<StoredViolation>> {
        Ok(self.violations.get(&id.0).cloned())
    }
}

impl OwnerRegistry for InMemoryLedger {
    fn register_owner(&mut self, owner: &VehicleOwner) -> Result<()> {
        let plate = normalize_plate(&owner.license_plate);
        if plate.is_empty() {
            return Err(anyhow!("license plate must not be empty"));
        }
        let mut owner = owner.clone();
        owner.license_plate = plate.clone();
        self.owners.insert(plate, owner);
        Ok(())
    }

    fn owner_for_plate(&mut self, plate: &str) -> Result<Option<VehicleOwner>> {
        Ok(self.owners.get(&normalize_plate(plate)).cloned())
    }
}

impl JobArchive for InMemoryLedger {
    fn archive_dead_letter(&mut self, job: &NotificationJob, error: &str) -> Result<()> {
        let id = self.dead_letters.len() as i64 + 1;
        self.dead_letters.push(DeadLetter {
            id,
            recorded_at: now_s()?,
            kind: job.kind(),
            payload: job.payload().clone(),
            attempt_count: job.attempt_count(),
            error: error.to_string(),
        });
        Ok(())
    }

    fn dead_letters(&mut self, limit: usize) -> Result<Vec<DeadLetter>> {
        Ok(self.dead_letters.iter().rev().take(limit).cloned().collect())
    }

    fn stash_pending_jobs(&mut self, jobs: &[PendingJob]) -> Result<usize> {
        self.outbox.extend_from_slice(jobs);
        Ok(jobs.len())
    }

    fn take_stashed_jobs(&mut self) -> Result<Vec<PendingJob>> {
        Ok(std::mem::take(&mut self.outbox))
    }
}
