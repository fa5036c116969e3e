//! Legacy fingerprint-file migration.
//!
//! Format: lines starting with `#` are comments; data lines have the form
//! `portDir:hex-crc32`; blank and malformed lines are warned-and-skipped.
//! The input file is renamed with a `.bak` suffix after a successful
//! import, which is also what makes a second run a no-op (the `.bak` file
//! is no longer named the original, so a repeat invocation against the
//! same path finds nothing to import).

use crate::db::Database;
use crate::error::DbError;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("legacy fingerprint file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to rename {path} to {backup}: {source}")]
    Rename {
        path: PathBuf,
        backup: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub imported: usize,
    pub skipped: Vec<(usize, String)>,
}

/// Idempotent: the second consecutive run against the same path finds the
/// file already renamed to `.bak` and does nothing.
pub fn migrate_fingerprints(db: &Database, path: &Path) -> Result<MigrationReport, MigrateError> {
    if !path.exists() {
        return Ok(MigrationReport::default());
    }

    let contents = std::fs::read_to_string(path).map_err(|source| MigrateError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut report = MigrationReport::default();
    for (line_no, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_data_line(line) {
            Some((port_dir, crc)) => {
                db.update_crc(&port_dir, crc)?;
                report.imported += 1;
            }
            None => {
                tracing::warn!(line = line_no + 1, content = %raw_line, "skipping malformed legacy fingerprint line");
                report.skipped.push((line_no + 1, raw_line.to_string()));
            }
        }
    }

    let backup = backup_path(path);
    std::fs::rename(path, &backup).map_err(|source| MigrateError::Rename {
        path: path.to_path_buf(),
        backup,
        source,
    })?;

    Ok(report)
}

fn parse_data_line(line: &str) -> Option<(String, u32)> {
    let (port_dir, hex_crc) = line.rsplit_once(':')?;
    if port_dir.is_empty() || hex_crc.is_empty() {
        return None;
    }
    let crc = u32::from_str_radix(hex_crc, 16).ok()?;
    Some((port_dir.to_string(), crc))
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(".bak");
    path.with_file_name(name)
}
