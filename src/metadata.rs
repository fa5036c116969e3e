//! Port Metadata Query (component B) — a thin adapter that extracts named
//! variables from a port definition via an external tool, or from a
//! pre-recorded fixture for tests.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::Command;

/// The nine meaningful fields every `MetadataQuery` implementation must
/// produce. The on-disk fixture format additionally repeats `pkg_filename`
/// as its third line "for historical reasons"; that duplication is a
/// fixture-file detail, not part of this struct.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMetadata {
    pub pkg_filename: String,
    pub version: String,
    pub fetch_deps: String,
    pub extract_deps: String,
    pub patch_deps: String,
    pub build_deps: String,
    pub lib_deps: String,
    pub run_deps: String,
    pub ignore_reason: String,
}

impl PortMetadata {
    pub fn is_ignored(&self) -> bool {
        !self.ignore_reason.trim().is_empty()
    }
}

pub trait MetadataQuery: Send + Sync {
    fn query(&self, port_dir: &str, flavor: Option<&str>) -> Result<PortMetadata>;
}

/// Reads the 10-line fixture format:
/// pkgFilename, pkgVersion, pkgFilename (repeated), fetchDeps, extractDeps,
/// patchDeps, buildDeps, libDeps, runDeps, ignoreReason. Empty line = empty
/// value.
pub struct FixtureMetadataQuery {
    fixtures_root: std::path::PathBuf,
}

impl FixtureMetadataQuery {
    pub fn new(fixtures_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            fixtures_root: fixtures_root.into(),
        }
    }

    fn fixture_path(&self, port_dir: &str, flavor: Option<&str>) -> std::path::PathBuf {
        let file_name = match flavor {
            Some(flavor) => format!("{port_dir}@{flavor}.fixture"),
            None => format!("{port_dir}.fixture"),
        };
        self.fixtures_root.join(file_name)
    }

    pub fn parse_fixture_text(text: &str) -> Result<PortMetadata> {
        let mut lines = text.lines();
        let mut field = || -> String { lines.next().unwrap_or("").to_string() };

        let pkg_filename = field();
        let version = field();
        let repeated_pkg_filename = field();
        if !repeated_pkg_filename.is_empty() && repeated_pkg_filename != pkg_filename {
            bail!(
                "fixture line 3 (repeated pkgFilename) does not match line 1: '{}' vs '{}'",
                repeated_pkg_filename,
                pkg_filename
            );
        }
        let fetch_deps = field();
        let extract_deps = field();
        let patch_deps = field();
        let build_deps = field();
        let lib_deps = field();
        let run_deps = field();
        let ignore_reason = field();

        Ok(PortMetadata {
            pkg_filename,
            version,
            fetch_deps,
            extract_deps,
            patch_deps,
            build_deps,
            lib_deps,
            run_deps,
            ignore_reason,
        })
    }
}

impl MetadataQuery for FixtureMetadataQuery {
    fn query(&self, port_dir: &str, flavor: Option<&str>) -> Result<PortMetadata> {
        let path = self.fixture_path(port_dir, flavor);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading metadata fixture {}", path.display()))?;
        Self::parse_fixture_text(&text)
            .with_context(|| format!("parsing metadata fixture {}", path.display()))
    }
}

/// Invokes the configured host port-build tool to extract the same nine
/// fields. The exact invocation contract of the host tool is an external
/// collaborator; this adapter owns only the parse/invoke boundary around it.
pub struct ExternalToolMetadataQuery {
    ports_dir: std::path::PathBuf,
    tool: String,
}

impl ExternalToolMetadataQuery {
    pub fn new(ports_dir: impl Into<std::path::PathBuf>, tool: impl Into<String>) -> Self {
        Self {
            ports_dir: ports_dir.into(),
            tool: tool.into(),
        }
    }

    const VARS: [&'static str; 8] = [
        "PKGFILE",
        "PKGVERSION",
        "FETCH_DEPENDS",
        "EXTRACT_DEPENDS",
        "PATCH_DEPENDS",
        "BUILD_DEPENDS",
        "LIB_DEPENDS",
        "RUN_DEPENDS",
    ];
}

impl MetadataQuery for ExternalToolMetadataQuery {
    fn query(&self, port_dir: &str, flavor: Option<&str>) -> Result<PortMetadata> {
        let dir = self.ports_dir.join(port_dir);
        let mut command = Command::new(&self.tool);
        command
            .current_dir(&dir)
            .args(Self::VARS.iter().flat_map(|v| ["-V", v]));
        if let Some(flavor) = flavor {
            command.env("FLAVOR", flavor);
        }
        let output = command
            .output()
            .with_context(|| format!("invoking metadata tool '{}' in {}", self.tool, dir.display()))?;
        if !output.status.success() {
            bail!(
                "metadata tool '{}' exited with status {:?} in {}",
                self.tool,
                output.status.code(),
                dir.display()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut fields = stdout.lines();
        let mut next = || -> String { fields.next().unwrap_or("").trim().to_string() };

        let pkg_filename = next();
        let version = next();
        let fetch_deps = next();
        let extract_deps = next();
        let patch_deps = next();
        let build_deps = next();
        let lib_deps = next();
        let run_deps = next();

        let ignore_reason = query_ignore_reason(&self.tool, &dir)?;

        Ok(PortMetadata {
            pkg_filename,
            version,
            fetch_deps,
            extract_deps,
            patch_deps,
            build_deps,
            lib_deps,
            run_deps,
            ignore_reason,
        })
    }
}

fn query_ignore_reason(tool: &str, dir: &Path) -> Result<String> {
    let output = Command::new(tool)
        .current_dir(dir)
        .args(["-V", "IGNORE"])
        .output()
        .with_context(|| format!("querying IGNORE variable in {}", dir.display()))?;
    if !output.status.success() {
        return Ok(String::new());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_fixture() {
        let text = "vim-9.0.1.pkg\n9.0.1\nvim-9.0.1.pkg\nncurses\nbzip2\n\ngettext\nlibiconv\n\n\n";
        let meta = FixtureMetadataQuery::parse_fixture_text(text).unwrap();
        assert_eq!(meta.pkg_filename, "vim-9.0.1.pkg");
        assert_eq!(meta.version, "9.0.1");
        assert_eq!(meta.fetch_deps, "ncurses");
        assert_eq!(meta.extract_deps, "bzip2");
        assert_eq!(meta.patch_deps, "");
        assert_eq!(meta.build_deps, "gettext");
        assert_eq!(meta.lib_deps, "libiconv");
        assert_eq!(meta.run_deps, "");
        assert_eq!(meta.ignore_reason, "");
        assert!(!meta.is_ignored());
    }

    #[test]
    fn rejects_mismatched_repeated_filename() {
        let text = "a.pkg\n1.0\nb.pkg\n\n\n\n\n\n\n\n";
        assert!(FixtureMetadataQuery::parse_fixture_text(text).is_err());
    }

    #[test]
    fn short_fixture_fills_missing_fields_empty() {
        let text = "a.pkg\n1.0\n";
        let meta = FixtureMetadataQuery::parse_fixture_text(text).unwrap();
        assert_eq!(meta.pkg_filename, "a.pkg");
        assert_eq!(meta.version, "1.0");
        assert_eq!(meta.ignore_reason, "");
    }
}
