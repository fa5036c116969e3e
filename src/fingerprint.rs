//! Fingerprint Hasher (component H) — deterministic 32-bit content fingerprint
//! of a port's source directory.

use crate::error::FingerprintError;
use std::path::{Path, PathBuf};

const EXCLUDED_TOP_LEVEL: [&str; 2] = ["work", ".git"];

/// Computes a CRC32 fingerprint over every regular file in `port_dir`,
/// excluding any path whose first path component is `work` or `.git`.
///
/// Serialization (stable across implementations): for each file in sorted
/// relative-path order, fold `len(path) path len(content) content` (lengths
/// as little-endian u64) into the running hash.
pub fn hash_port_dir(port_dir: &Path) -> Result<u32, FingerprintError> {
    if !port_dir.is_dir() {
        return Err(FingerprintError::MissingDirectory(port_dir.to_path_buf()));
    }

    let mut files = collect_regular_files(port_dir)?;
    files.sort();

    let mut hasher = crc32fast::Hasher::new();
    for relative in &files {
        let absolute = port_dir.join(relative);
        let content = std::fs::read(&absolute).map_err(|source| FingerprintError::Io {
            path: absolute.clone(),
            source,
        })?;
        let path_bytes = relative.to_string_lossy();
        let path_bytes = path_bytes.as_bytes();

        hasher.update(&(path_bytes.len() as u64).to_le_bytes());
        hasher.update(path_bytes);
        hasher.update(&(content.len() as u64).to_le_bytes());
        hasher.update(&content);
    }

    Ok(hasher.finalize())
}

fn collect_regular_files(root: &Path) -> Result<Vec<PathBuf>, FingerprintError> {
    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    Ok(out)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), FingerprintError> {
    let entries = std::fs::read_dir(dir).map_err(|source| FingerprintError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| FingerprintError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .expect("walked path is always under root")
            .to_path_buf();

        if let Some(first) = relative.components().next() {
            if let Some(name) = first.as_os_str().to_str() {
                if EXCLUDED_TOP_LEVEL.contains(&name) {
                    continue;
                }
            }
        }

        let file_type = entry.file_type().map_err(|source| FingerprintError::Io {
            path: path.clone(),
            source,
        })?;
        if file_type.is_dir() {
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            out.push(relative);
        }
        // Symlinks are neither, and are skipped: only regular-file content
        // contributes to the fingerprint.
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn deterministic_across_repeated_calls() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Makefile"), b"build stuff").unwrap();
        let a = hash_port_dir(dir.path()).unwrap();
        let b = hash_port_dir(dir.path()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sensitive_to_content_change() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Makefile"), b"v1").unwrap();
        let a = hash_port_dir(dir.path()).unwrap();
        fs::write(dir.path().join("Makefile"), b"v2").unwrap();
        let b = hash_port_dir(dir.path()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sensitive_to_rename() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"same content").unwrap();
        let a = hash_port_dir(dir.path()).unwrap();
        fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt")).unwrap();
        let b = hash_port_dir(dir.path()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn ignores_work_and_git_directories() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Makefile"), b"stable").unwrap();
        let base = hash_port_dir(dir.path()).unwrap();

        fs::create_dir_all(dir.path().join("work")).unwrap();
        fs::write(dir.path().join("work").join("scratch"), b"build output").unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git").join("HEAD"), b"ref: refs/heads/main").unwrap();

        let after = hash_port_dir(dir.path()).unwrap();
        assert_eq!(base, after);
    }

    #[test]
    fn errors_on_missing_directory() {
        let err = hash_port_dir(Path::new("/nonexistent/port/dir/for/tests"));
        assert!(matches!(err, Err(FingerprintError::MissingDirectory(_))));
    }

    proptest::proptest! {
        #[test]
        fn determinism_holds_for_arbitrary_single_file_content(content in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256)) {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join("distfile"), &content).unwrap();
            let a = hash_port_dir(dir.path()).unwrap();
            let b = hash_port_dir(dir.path()).unwrap();
            proptest::prop_assert_eq!(a, b);
        }

        #[test]
        fn differing_content_almost_never_collides(
            a in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..64),
            b in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..64),
        ) {
            proptest::prop_assume!(a != b);
            let dir_a = tempdir().unwrap();
            fs::write(dir_a.path().join("distfile"), &a).unwrap();
            let dir_b = tempdir().unwrap();
            fs::write(dir_b.path().join("distfile"), &b).unwrap();
            proptest::prop_assert_ne!(
                hash_port_dir(dir_a.path()).unwrap(),
                hash_port_dir(dir_b.path()).unwrap()
            );
        }
    }
}
