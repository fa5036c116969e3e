//! Build Database (component A) — an embedded, transactional, crash-safe
//! key-value store of build records, the per-(port,version) latest-success
//! index, and content-addressed fingerprints.
//!
//! Backed by `sled`, whose named `Tree`s give each logical keyspace
//! (`builds`, `packages`, `crc`, and a `runs` tree for the live-monitoring
//! snapshot) its own namespace within one on-disk database.

use crate::error::DbError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub uuid: Uuid,
    pub port_dir: String,
    pub version: String,
    pub status: BuildStatus,
    pub start_time: DateTime<Utc>,
    /// `None` while the build is `running`.
    pub end_time: Option<DateTime<Utc>>,
}

impl BuildRecord {
    pub fn start(uuid: Uuid, port_dir: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            uuid,
            port_dir: port_dir.into(),
            version: version.into(),
            status: BuildStatus::Running,
            start_time: Utc::now(),
            end_time: None,
        }
    }
}

const TREE_BUILDS: &str = "builds";
const TREE_PACKAGES: &str = "packages";
const TREE_CRC: &str = "crc";
const TREE_RUNS: &str = "runs";
const ACTIVE_RUN_KEY: &[u8] = b"__active__";

pub struct Database {
    db: sled::Db,
    builds: sled::Tree,
    packages: sled::Tree,
    crc: sled::Tree,
    runs: sled::Tree,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let db = sled::open(path).map_err(|e| DbError::database("open", e))?;
        let builds = db
            .open_tree(TREE_BUILDS)
            .map_err(|e| DbError::database("open-builds-tree", e))?;
        let packages = db
            .open_tree(TREE_PACKAGES)
            .map_err(|e| DbError::database("open-packages-tree", e))?;
        let crc = db
            .open_tree(TREE_CRC)
            .map_err(|e| DbError::database("open-crc-tree", e))?;
        let runs = db
            .open_tree(TREE_RUNS)
            .map_err(|e| DbError::database("open-runs-tree", e))?;
        Ok(Self {
            db,
            builds,
            packages,
            crc,
            runs,
        })
    }

    /// Idempotent: repeated calls simply flush again.
    pub fn close(&self) -> Result<(), DbError> {
        self.db.flush().map_err(|e| DbError::database("close", e))?;
        Ok(())
    }

    pub fn save_record(&self, record: &BuildRecord) -> Result<(), DbError> {
        if record.uuid.is_nil() {
            return Err(DbError::Validation {
                op: "save_record",
                reason: "uuid must not be empty".to_string(),
            });
        }
        let payload = serde_json::to_vec(record)
            .map_err(|e| DbError::database("save_record-serialize", e))?;
        self.builds
            .insert(record.uuid.as_bytes(), payload)
            .map_err(|e| DbError::database("save_record", e))?;
        Ok(())
    }

    pub fn get_record(&self, uuid: Uuid) -> Result<BuildRecord, DbError> {
        if uuid.is_nil() {
            return Err(DbError::Validation {
                op: "get_record",
                reason: "uuid must not be empty".to_string(),
            });
        }
        let bytes = self
            .builds
            .get(uuid.as_bytes())
            .map_err(|e| DbError::database("get_record", e))?
            .ok_or_else(|| DbError::RecordNotFound {
                uuid: uuid.to_string(),
            })?;
        deserialize_record(&bytes, uuid)
    }

    /// Atomic read-modify-write: every observer sees either the pre- or
    /// post-transition record, never an intermediate state.
    pub fn update_record_status(
        &self,
        uuid: Uuid,
        status: BuildStatus,
        end_time: DateTime<Utc>,
    ) -> Result<(), DbError> {
        if uuid.is_nil() {
            return Err(DbError::Validation {
                op: "update_record_status",
                reason: "uuid must not be empty".to_string(),
            });
        }
        let key = *uuid.as_bytes();
        let result = self.builds.transaction(move |tx| {
            let existing = tx.get(&key)?.ok_or_else(|| {
                ConflictableTransactionError::Abort(DbError::RecordNotFound {
                    uuid: Uuid::from_bytes(key).to_string(),
                })
            })?;
            let mut record: BuildRecord = serde_json::from_slice(&existing).map_err(|e| {
                ConflictableTransactionError::Abort(DbError::CorruptedData {
                    uuid: Uuid::from_bytes(key).to_string(),
                    reason: e.to_string(),
                })
            })?;
            record.status = status;
            record.end_time = Some(end_time);
            let payload = serde_json::to_vec(&record).map_err(|e| {
                ConflictableTransactionError::Abort(DbError::database(
                    "update_record_status-serialize",
                    e,
                ))
            })?;
            tx.insert(&key, payload)?;
            Ok(())
        });
        map_transaction_result(result)
    }

    pub fn update_package_index(
        &self,
        port_dir: &str,
        version: &str,
        uuid: Uuid,
    ) -> Result<(), DbError> {
        let key = package_key(port_dir, version);
        self.packages
            .insert(key, uuid.as_bytes().to_vec())
            .map_err(|e| DbError::database("update_package_index", e))?;
        Ok(())
    }

    /// `OrphanedRecord` if the index points at a uuid with no matching
    /// `BuildRecord`; `Ok(None)` if there is simply no index entry yet.
    pub fn latest_for(
        &self,
        port_dir: &str,
        version: &str,
    ) -> Result<Option<BuildRecord>, DbError> {
        let key = package_key(port_dir, version);
        let Some(uuid_bytes) = self
            .packages
            .get(&key)
            .map_err(|e| DbError::database("latest_for", e))?
        else {
            return Ok(None);
        };
        let uuid = parse_uuid_bytes(&uuid_bytes)?;
        match self.get_record(uuid) {
            Ok(record) => Ok(Some(record)),
            Err(DbError::RecordNotFound { uuid }) => Err(DbError::OrphanedRecord {
                port_dir: port_dir.to_string(),
                version: version.to_string(),
                uuid,
            }),
            Err(other) => Err(other),
        }
    }

    pub fn update_crc(&self, port_dir: &str, crc: u32) -> Result<(), DbError> {
        self.crc
            .insert(port_dir.as_bytes(), &crc.to_be_bytes())
            .map_err(|e| DbError::database("update_crc", e))?;
        Ok(())
    }

    /// `None` means "never built successfully here".
    pub fn get_crc(&self, port_dir: &str) -> Result<Option<u32>, DbError> {
        let bytes = self
            .crc
            .get(port_dir.as_bytes())
            .map_err(|e| DbError::database("get_crc", e))?;
        Ok(bytes.map(|v| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&v[..4.min(v.len())]);
            u32::from_be_bytes(buf)
        }))
    }

    pub fn needs_build(&self, port_dir: &str, current_crc: u32) -> Result<bool, DbError> {
        Ok(match self.get_crc(port_dir)? {
            None => true,
            Some(stored) => stored != current_crc,
        })
    }

    pub fn update_run_snapshot(&self, run_id: &str, json: &str) -> Result<(), DbError> {
        if run_id.is_empty() {
            return Err(DbError::Validation {
                op: "update_run_snapshot",
                reason: "runID must not be empty".to_string(),
            });
        }
        self.runs
            .insert(run_key(run_id), json.as_bytes())
            .map_err(|e| DbError::database("update_run_snapshot", e))?;
        self.runs
            .insert(ACTIVE_RUN_KEY, run_id.as_bytes())
            .map_err(|e| DbError::database("update_run_snapshot-active-pointer", e))?;
        Ok(())
    }

    pub fn get_run_snapshot(&self, run_id: &str) -> Result<String, DbError> {
        if run_id.is_empty() {
            return Err(DbError::Validation {
                op: "get_run_snapshot",
                reason: "runID must not be empty".to_string(),
            });
        }
        let bytes = self
            .runs
            .get(run_key(run_id))
            .map_err(|e| DbError::database("get_run_snapshot", e))?
            .ok_or_else(|| DbError::RecordNotFound {
                uuid: run_id.to_string(),
            })?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    pub fn active_run_snapshot(&self) -> Result<Option<String>, DbError> {
        let Some(run_id) = self
            .runs
            .get(ACTIVE_RUN_KEY)
            .map_err(|e| DbError::database("active_run_snapshot", e))?
        else {
            return Ok(None);
        };
        let run_id = String::from_utf8_lossy(&run_id).to_string();
        Ok(Some(self.get_run_snapshot(&run_id)?))
    }

    /// Ambient addition (SPEC_FULL §4.A): every `BuildRecord` still in
    /// `running` status, i.e. a build interrupted mid-run. Never silently
    /// transitioned; surfaced by the `doctor` CLI subcommand.
    pub fn orphaned_records(&self) -> Result<Vec<BuildRecord>, DbError> {
        let mut out = Vec::new();
        for entry in self.builds.iter() {
            let (key, value) = entry.map_err(|e| DbError::database("orphaned_records", e))?;
            let uuid = parse_uuid_bytes(&key)?;
            let record = deserialize_record(&value, uuid)?;
            if record.status == BuildStatus::Running {
                out.push(record);
            }
        }
        Ok(out)
    }
}

fn package_key(port_dir: &str, version: &str) -> Vec<u8> {
    format!("{port_dir}@{version}").into_bytes()
}

fn run_key(run_id: &str) -> Vec<u8> {
    format!("snapshot:{run_id}").into_bytes()
}

fn parse_uuid_bytes(bytes: &[u8]) -> Result<Uuid, DbError> {
    if let Ok(arr) = <[u8; 16]>::try_from(bytes) {
        return Ok(Uuid::from_bytes(arr));
    }
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| DbError::CorruptedData {
            uuid: String::from_utf8_lossy(bytes).to_string(),
            reason: "could not parse uuid bytes".to_string(),
        })
}

fn deserialize_record(bytes: &[u8], uuid: Uuid) -> Result<BuildRecord, DbError> {
    serde_json::from_slice(bytes).map_err(|e| DbError::CorruptedData {
        uuid: uuid.to_string(),
        reason: e.to_string(),
    })
}

fn map_transaction_result<T>(
    result: Result<T, TransactionError<DbError>>,
) -> Result<T, DbError> {
    result.map_err(|e| match e {
        TransactionError::Abort(db_err) => db_err,
        TransactionError::Storage(storage_err) => DbError::database("transaction", storage_err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_test_db() -> (tempfile::TempDir, Database) {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("builds.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn round_trips_a_build_record() {
        let (_dir, db) = open_test_db();
        let uuid = Uuid::new_v4();
        let record = BuildRecord::start(uuid, "editors/vim", "9.0.1");
        db.save_record(&record).unwrap();
        let fetched = db.get_record(uuid).unwrap();
        assert_eq!(fetched.port_dir, "editors/vim");
        assert_eq!(fetched.status, BuildStatus::Running);
        assert!(fetched.end_time.is_none());
    }

    #[test]
    fn update_record_status_is_atomic_and_visible() {
        let (_dir, db) = open_test_db();
        let uuid = Uuid::new_v4();
        db.save_record(&BuildRecord::start(uuid, "editors/vim", "9.0.1"))
            .unwrap();
        let end = Utc::now();
        db.update_record_status(uuid, BuildStatus::Success, end)
            .unwrap();
        let record = db.get_record(uuid).unwrap();
        assert_eq!(record.status, BuildStatus::Success);
        assert_eq!(record.end_time.unwrap().timestamp(), end.timestamp());
    }

    #[test]
    fn update_record_status_missing_uuid_errors() {
        let (_dir, db) = open_test_db();
        let err = db
            .update_record_status(Uuid::new_v4(), BuildStatus::Success, Utc::now())
            .unwrap_err();
        assert!(matches!(err, DbError::RecordNotFound { .. }));
    }

    #[test]
    fn needs_build_reflects_crc_presence_and_equality() {
        let (_dir, db) = open_test_db();
        assert!(db.needs_build("editors/vim", 42).unwrap());
        db.update_crc("editors/vim", 42).unwrap();
        assert!(!db.needs_build("editors/vim", 42).unwrap());
        assert!(db.needs_build("editors/vim", 43).unwrap());
    }

    #[test]
    fn latest_for_detects_orphaned_index_pointer() {
        let (_dir, db) = open_test_db();
        let ghost = Uuid::new_v4();
        db.update_package_index("editors/vim", "9.0.1", ghost)
            .unwrap();
        let err = db.latest_for("editors/vim", "9.0.1").unwrap_err();
        assert!(matches!(err, DbError::OrphanedRecord { .. }));
    }

    #[test]
    fn latest_for_resolves_successfully_recorded_build() {
        let (_dir, db) = open_test_db();
        let uuid = Uuid::new_v4();
        let mut record = BuildRecord::start(uuid, "editors/vim", "9.0.1");
        db.save_record(&record).unwrap();
        record.status = BuildStatus::Success;
        record.end_time = Some(Utc::now());
        db.update_record_status(uuid, BuildStatus::Success, record.end_time.unwrap())
            .unwrap();
        db.update_package_index("editors/vim", "9.0.1", uuid)
            .unwrap();

        let latest = db.latest_for("editors/vim", "9.0.1").unwrap().unwrap();
        assert_eq!(latest.uuid, uuid);
    }

    #[test]
    fn orphaned_records_reports_only_running_builds() {
        let (_dir, db) = open_test_db();
        let running = Uuid::new_v4();
        db.save_record(&BuildRecord::start(running, "editors/vim", "9.0.1"))
            .unwrap();
        let done = Uuid::new_v4();
        db.save_record(&BuildRecord::start(done, "editors/emacs", "29.1"))
            .unwrap();
        db.update_record_status(done, BuildStatus::Success, Utc::now())
            .unwrap();

        let orphans = db.orphaned_records().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].uuid, running);
    }

    #[test]
    fn run_snapshot_tracks_at_most_one_active_run() {
        let (_dir, db) = open_test_db();
        db.update_run_snapshot("run-a", "{\"total\":1}").unwrap();
        db.update_run_snapshot("run-b", "{\"total\":2}").unwrap();
        let active = db.active_run_snapshot().unwrap().unwrap();
        assert_eq!(active, "{\"total\":2}");
        assert_eq!(db.get_run_snapshot("run-a").unwrap(), "{\"total\":1}");
    }

    #[test]
    fn empty_uuid_is_a_validation_error() {
        let (_dir, db) = open_test_db();
        let err = db.get_record(Uuid::nil()).unwrap_err();
        assert!(matches!(err, DbError::Validation { .. }));
    }
}
