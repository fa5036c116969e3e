//! Build Planner (component D) — fingerprints each Package, consults the
//! database for change detection, and produces the permissive topological
//! schedule the orchestrator consumes.

use crate::db::Database;
use crate::error::PlanError;
use crate::fingerprint;
use crate::resolver::{DependencyKind, NodeId, Resolution};
use std::path::Path;

/// Whether a Package not itself NEEDS_BUILD, but with a NEEDS_BUILD
/// ancestor, must rebuild anyway. Both are kept selectable rather than
/// hardcoded so the crate can be run either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropagationPolicy {
    /// Only packages whose own fingerprint changed are marked NEEDS_BUILD.
    None,
    /// NEEDS_BUILD propagates forward over `lib`/`build` edges only;
    /// `fetch`/`extract`/`patch`/`run` edges never force a dependent rebuild.
    #[default]
    LibBuildOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanLabel {
    NeedsBuild,
    SkippedPre,
    Ignored,
    UpToDate,
}

#[derive(Debug, Clone)]
pub struct PlannedPackage {
    pub id: NodeId,
    pub label: PlanLabel,
}

pub struct Plan {
    pub order: Vec<PlannedPackage>,
}

impl Plan {
    pub fn enqueueable(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.order
            .iter()
            .filter(|p| p.label == PlanLabel::NeedsBuild)
            .map(|p| p.id)
    }
}

pub struct Planner<'a> {
    db: &'a Database,
    ports_dir: &'a Path,
    policy: PropagationPolicy,
}

impl<'a> Planner<'a> {
    pub fn new(db: &'a Database, ports_dir: &'a Path, policy: PropagationPolicy) -> Self {
        Self {
            db,
            ports_dir,
            policy,
        }
    }

    pub fn plan(&self, resolution: &mut Resolution) -> Result<Plan, PlanError> {
        for i in 0..resolution.node_count() {
            let id = NodeId(i);
            let pkg = resolution.get(id);
            if pkg.flags.ignored || pkg.flags.skipped_pre {
                continue;
            }

            let port_dir = pkg.port_dir();
            let source_dir = self.ports_dir.join(&port_dir);
            let crc = fingerprint::hash_port_dir(&source_dir).map_err(|source| PlanError::Hash {
                path: source_dir.clone(),
                source: match source {
                    crate::error::FingerprintError::Io { source, .. } => source,
                    crate::error::FingerprintError::MissingDirectory(_) => {
                        std::io::Error::new(std::io::ErrorKind::NotFound, "port source missing")
                    }
                },
            })?;

            let needs_build =
                self.db
                    .needs_build(&port_dir, crc)
                    .map_err(|source| PlanError::Database {
                        port_dir: port_dir.clone(),
                        source,
                    })?;

            let pkg = resolution.get_mut(id);
            pkg.build_fingerprint = Some(crc);
            pkg.flags.needs_build = needs_build;
        }

        if self.policy == PropagationPolicy::LibBuildOnly {
            self.propagate_needs_build(resolution);
        }

        let order = resolution.topo_permissive();
        let labeled = order
            .into_iter()
            .map(|id| {
                let pkg = resolution.get(id);
                let label = if pkg.flags.ignored {
                    PlanLabel::Ignored
                } else if pkg.flags.skipped_pre {
                    PlanLabel::SkippedPre
                } else if pkg.flags.needs_build {
                    PlanLabel::NeedsBuild
                } else {
                    PlanLabel::UpToDate
                };
                PlannedPackage { id, label }
            })
            .collect();

        Ok(Plan { order: labeled })
    }

    /// Forward-propagates NEEDS_BUILD over `lib`/`build` edges: if any
    /// dependency a Package relies on (via a gating edge kind) is itself
    /// NEEDS_BUILD, this Package must rebuild too, even if its own
    /// fingerprint is unchanged.
    fn propagate_needs_build(&self, resolution: &mut Resolution) {
        let order = resolution.topo_permissive();
        for id in order {
            if resolution.get(id).flags.needs_build {
                continue;
            }
            if resolution.get(id).flags.ignored || resolution.get(id).flags.skipped_pre {
                continue;
            }
            let dep_needs_build = resolution
                .forward
                .get(&id)
                .map(|edges| {
                    edges
                        .iter()
                        .filter(|e| e.kind.gates_enqueue())
                        .any(|e| resolution.get(e.to).flags.needs_build)
                })
                .unwrap_or(false);
            if dep_needs_build {
                resolution.get_mut(id).flags.needs_build = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataQuery, PortMetadata};
    use crate::resolver::Resolver;
    use anyhow::Result;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    struct MapMetadataQuery {
        entries: RefCell<HashMap<String, PortMetadata>>,
    }

    impl MetadataQuery for MapMetadataQuery {
        fn query(&self, port_dir: &str, _flavor: Option<&str>) -> Result<PortMetadata> {
            self.entries
                .borrow()
                .get(port_dir)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no fixture for {port_dir}"))
        }
    }

    fn meta(version: &str, build_deps: &str) -> PortMetadata {
        PortMetadata {
            pkg_filename: format!("pkg-{version}"),
            version: version.to_string(),
            build_deps: build_deps.to_string(),
            ..Default::default()
        }
    }

    fn setup_port_tree(root: &Path, dirs: &[&str]) {
        for dir in dirs {
            fs::create_dir_all(root.join(dir)).unwrap();
            fs::write(root.join(dir).join("Makefile"), b"stub").unwrap();
        }
    }

    #[test]
    fn first_plan_flags_every_package_needs_build() {
        let ports = tempdir().unwrap();
        setup_port_tree(ports.path(), &["libs/b", "apps/app"]);

        let mut entries = HashMap::new();
        entries.insert("apps/app".to_string(), meta("1.0", "libs/b"));
        entries.insert("libs/b".to_string(), meta("1.0", ""));
        let query = MapMetadataQuery {
            entries: RefCell::new(entries),
        };
        let mut resolution = Resolver::new(&query)
            .resolve(&["apps/app".to_string()])
            .unwrap();

        let dbdir = tempdir().unwrap();
        let db = Database::open(&dbdir.path().join("db")).unwrap();
        let planner = Planner::new(&db, ports.path(), PropagationPolicy::LibBuildOnly);
        let plan = planner.plan(&mut resolution).unwrap();

        assert_eq!(plan.enqueueable().count(), 2);
    }

    #[test]
    fn unchanged_fingerprint_skips_rebuild_without_propagation() {
        let ports = tempdir().unwrap();
        setup_port_tree(ports.path(), &["libs/b"]);

        let mut entries = HashMap::new();
        entries.insert("libs/b".to_string(), meta("1.0", ""));
        let query = MapMetadataQuery {
            entries: RefCell::new(entries),
        };

        let dbdir = tempdir().unwrap();
        let db = Database::open(&dbdir.path().join("db")).unwrap();

        let crc = fingerprint::hash_port_dir(&ports.path().join("libs/b")).unwrap();
        db.update_crc("libs/b", crc).unwrap();

        let mut resolution = Resolver::new(&query)
            .resolve(&["libs/b".to_string()])
            .unwrap();
        let planner = Planner::new(&db, ports.path(), PropagationPolicy::None);
        let plan = planner.plan(&mut resolution).unwrap();

        assert_eq!(plan.enqueueable().count(), 0);
    }

    #[test]
    fn lib_build_only_propagation_forces_dependent_rebuild() {
        let ports = tempdir().unwrap();
        setup_port_tree(ports.path(), &["libs/b", "apps/app"]);

        let mut entries = HashMap::new();
        entries.insert("apps/app".to_string(), meta("1.0", "libs/b"));
        entries.insert("libs/b".to_string(), meta("1.0", ""));
        let query = MapMetadataQuery {
            entries: RefCell::new(entries),
        };

        let dbdir = tempdir().unwrap();
        let db = Database::open(&dbdir.path().join("db")).unwrap();
        // Only "apps/app" is already up to date; "libs/b" has never built.
        let app_crc = fingerprint::hash_port_dir(&ports.path().join("apps/app")).unwrap();
        db.update_crc("apps/app", app_crc).unwrap();

        let mut resolution = Resolver::new(&query)
            .resolve(&["apps/app".to_string()])
            .unwrap();
        let planner = Planner::new(&db, ports.path(), PropagationPolicy::LibBuildOnly);
        let plan = planner.plan(&mut resolution).unwrap();

        // Both must rebuild: "libs/b" directly, "apps/app" via propagation.
        assert_eq!(plan.enqueueable().count(), 2);
    }

    #[test]
    fn none_policy_leaves_dependent_up_to_date() {
        let ports = tempdir().unwrap();
        setup_port_tree(ports.path(), &["libs/b", "apps/app"]);

        let mut entries = HashMap::new();
        entries.insert("apps/app".to_string(), meta("1.0", "libs/b"));
        entries.insert("libs/b".to_string(), meta("1.0", ""));
        let query = MapMetadataQuery {
            entries: RefCell::new(entries),
        };

        let dbdir = tempdir().unwrap();
        let db = Database::open(&dbdir.path().join("db")).unwrap();
        let app_crc = fingerprint::hash_port_dir(&ports.path().join("apps/app")).unwrap();
        db.update_crc("apps/app", app_crc).unwrap();

        let mut resolution = Resolver::new(&query)
            .resolve(&["apps/app".to_string()])
            .unwrap();
        let planner = Planner::new(&db, ports.path(), PropagationPolicy::None);
        let plan = planner.plan(&mut resolution).unwrap();

        assert_eq!(plan.enqueueable().count(), 1);
    }

    #[test]
    fn ignored_and_skipped_pre_packages_are_never_enqueued() {
        let ports = tempdir().unwrap();
        setup_port_tree(ports.path(), &["apps/app", "libs/bad"]);

        let mut entries = HashMap::new();
        entries.insert("apps/app".to_string(), meta("1.0", "libs/bad"));
        let mut bad = meta("1.0", "");
        bad.ignore_reason = "unsupported platform".to_string();
        entries.insert("libs/bad".to_string(), bad);
        let query = MapMetadataQuery {
            entries: RefCell::new(entries),
        };

        let mut resolution = Resolver::new(&query)
            .resolve(&["apps/app".to_string()])
            .unwrap();
        let dbdir = tempdir().unwrap();
        let db = Database::open(&dbdir.path().join("db")).unwrap();
        let planner = Planner::new(&db, ports.path(), PropagationPolicy::LibBuildOnly);
        let plan = planner.plan(&mut resolution).unwrap();

        assert_eq!(plan.enqueueable().count(), 0);
        let labels: Vec<PlanLabel> = plan.order.iter().map(|p| p.label).collect();
        assert!(labels.contains(&PlanLabel::Ignored));
        assert!(labels.contains(&PlanLabel::SkippedPre));
    }
}
