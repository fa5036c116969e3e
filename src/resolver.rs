//! Dependency Resolver (component C) — turns root port specs into a Package
//! graph with flavors, dependency edges, and cycle handling.

use crate::error::CycleError;
use crate::metadata::MetadataQuery;
use crate::portref::PortRef;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyKind {
    Fetch,
    Extract,
    Patch,
    Build,
    Lib,
    Run,
}

impl DependencyKind {
    pub const ALL: [DependencyKind; 6] = [
        DependencyKind::Fetch,
        DependencyKind::Extract,
        DependencyKind::Patch,
        DependencyKind::Build,
        DependencyKind::Lib,
        DependencyKind::Run,
    ];

    /// Kinds that gate enqueueing in the orchestrator's feeder: a package is
    /// only enqueued once all its build/lib dependencies reach a terminal
    /// good state.
    pub fn gates_enqueue(self) -> bool {
        matches!(self, DependencyKind::Build | DependencyKind::Lib)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: DependencyKind,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PackageFlags {
    pub ignored: bool,
    pub skipped_pre: bool,
    pub needs_build: bool,
}

#[derive(Debug, Clone)]
pub struct Package {
    pub port_ref: PortRef,
    pub version: String,
    pub package_filename: String,
    pub ignore_reason: Option<String>,
    pub fetch_deps_raw: String,
    pub extract_deps_raw: String,
    pub patch_deps_raw: String,
    pub build_deps_raw: String,
    pub lib_deps_raw: String,
    pub run_deps_raw: String,
    pub flags: PackageFlags,
    pub skip_reason: Option<String>,
    pub build_fingerprint: Option<u32>,
    pub build_uuid: Option<Uuid>,
}

impl Package {
    pub fn port_dir(&self) -> String {
        self.port_ref.port_dir()
    }
}

pub struct Resolution {
    pub packages: Vec<Package>,
    pub forward: HashMap<NodeId, Vec<Edge>>,
    pub reverse: HashMap<NodeId, Vec<Edge>>,
}

impl Resolution {
    pub fn get(&self, id: NodeId) -> &Package {
        &self.packages[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Package {
        &mut self.packages[id.0]
    }

    pub fn node_count(&self) -> usize {
        self.packages.len()
    }

    fn unique_targets(&self, id: NodeId) -> HashSet<NodeId> {
        self.forward
            .get(&id)
            .map(|edges| edges.iter().map(|e| e.to).collect())
            .unwrap_or_default()
    }

    fn unique_ancestors(&self, id: NodeId) -> HashSet<NodeId> {
        self.reverse
            .get(&id)
            .map(|edges| edges.iter().map(|e| e.from).collect())
            .unwrap_or_default()
    }

    /// Ready-set tie-break: dependency-count desc, then portDir lexicographic.
    fn ready_sort_key(&self, id: NodeId) -> (std::cmp::Reverse<usize>, String) {
        let dep_count = self.unique_targets(id).len();
        (std::cmp::Reverse(dep_count), self.get(id).port_dir())
    }

    /// Strict Kahn's-algorithm topological sort. Returns `CycleError`
    /// (carrying the partial order and the residual cycle nodes) if any
    /// package is unreachable by the time the queue drains.
    pub fn topo_strict(&self) -> std::result::Result<Vec<NodeId>, CycleError> {
        let total = self.node_count();
        let mut remaining: HashMap<NodeId, usize> = HashMap::new();
        for i in 0..total {
            let id = NodeId(i);
            remaining.insert(id, self.unique_targets(id).len());
        }

        let mut ready: Vec<NodeId> = remaining
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();
        ready.sort_by_key(|&id| self.ready_sort_key(id));

        let mut ordered = Vec::with_capacity(total);
        let mut queue = std::collections::VecDeque::from(ready);

        while let Some(id) = queue.pop_front() {
            ordered.push(id);
            let mut newly_ready = Vec::new();
            for anc in self.unique_ancestors(id) {
                if let Some(count) = remaining.get_mut(&anc) {
                    if *count > 0 {
                        *count -= 1;
                        if *count == 0 {
                            newly_ready.push(anc);
                        }
                    }
                }
            }
            newly_ready.sort_by_key(|&id| self.ready_sort_key(id));
            for id in newly_ready {
                queue.push_back(id);
            }
        }

        if ordered.len() < total {
            let ordered_set: HashSet<NodeId> = ordered.iter().copied().collect();
            let cycle_packages: Vec<String> = (0..total)
                .map(NodeId)
                .filter(|id| !ordered_set.contains(id))
                .map(|id| self.get(id).port_dir())
                .collect();
            let ordered_packages: Vec<String> =
                ordered.iter().map(|&id| self.get(id).port_dir()).collect();
            return Err(CycleError {
                total_packages: total,
                ordered_packages,
                cycle_packages,
            });
        }

        Ok(ordered)
    }

    /// Best-effort topological order that breaks cycles by forcibly
    /// resolving a deterministic node (lowest ready-sort key) when Kahn's
    /// algorithm stalls, logging the break. Never fails.
    pub fn topo_permissive(&self) -> Vec<NodeId> {
        let total = self.node_count();
        let mut remaining: HashMap<NodeId, usize> = HashMap::new();
        for i in 0..total {
            let id = NodeId(i);
            remaining.insert(id, self.unique_targets(id).len());
        }

        let mut ordered = Vec::with_capacity(total);
        let mut done: HashSet<NodeId> = HashSet::new();

        loop {
            if ordered.len() == total {
                break;
            }
            let mut ready: Vec<NodeId> = remaining
                .iter()
                .filter(|(id, &count)| count == 0 && !done.contains(id))
                .map(|(&id, _)| id)
                .collect();

            if ready.is_empty() {
                // Stalled: a cycle remains among the unresolved nodes. Break
                // it by forcing the lexicographically-first unresolved node
                // through, as if its remaining deps were already satisfied.
                let mut stuck: Vec<NodeId> = (0..total)
                    .map(NodeId)
                    .filter(|id| !done.contains(id))
                    .collect();
                stuck.sort_by_key(|&id| self.ready_sort_key(id));
                let forced = stuck[0];
                tracing::warn!(
                    port = %self.get(forced).port_dir(),
                    "breaking dependency cycle by forcing port through permissive order"
                );
                ready.push(forced);
            }

            ready.sort_by_key(|&id| self.ready_sort_key(id));
            for id in ready {
                if done.contains(&id) {
                    continue;
                }
                done.insert(id);
                ordered.push(id);
                for anc in self.unique_ancestors(id) {
                    if let Some(count) = remaining.get_mut(&anc) {
                        if *count > 0 {
                            *count -= 1;
                        }
                    }
                }
            }
        }

        ordered
    }
}

pub struct Resolver<'q> {
    metadata: &'q dyn MetadataQuery,
    packages: Vec<Package>,
    index: HashMap<PortRef, NodeId>,
    forward: HashMap<NodeId, Vec<Edge>>,
    reverse: HashMap<NodeId, Vec<Edge>>,
    seen_edges: HashSet<(NodeId, NodeId, DependencyKind)>,
}

impl<'q> Resolver<'q> {
    pub fn new(metadata: &'q dyn MetadataQuery) -> Self {
        Self {
            metadata,
            packages: Vec::new(),
            index: HashMap::new(),
            forward: HashMap::new(),
            reverse: HashMap::new(),
            seen_edges: HashSet::new(),
        }
    }

    pub fn resolve(mut self, roots: &[String]) -> Result<Resolution> {
        for raw in roots {
            let port_ref = PortRef::parse(raw)
                .with_context(|| format!("invalid port spec '{raw}'"))?;
            self.get_or_create(port_ref)?;
        }
        self.propagate_ignored();

        Ok(Resolution {
            packages: self.packages,
            forward: self.forward,
            reverse: self.reverse,
        })
    }

    fn get_or_create(&mut self, port_ref: PortRef) -> Result<NodeId> {
        if let Some(&id) = self.index.get(&port_ref) {
            return Ok(id);
        }

        let meta = self
            .metadata
            .query(&port_ref.port_dir(), port_ref.flavor.as_deref())
            .with_context(|| format!("querying metadata for {port_ref}"))?;

        let ignore_reason = if meta.is_ignored() {
            Some(meta.ignore_reason.clone())
        } else {
            None
        };

        let package = Package {
            port_ref: port_ref.clone(),
            version: meta.version.clone(),
            package_filename: meta.pkg_filename.clone(),
            ignore_reason,
            fetch_deps_raw: meta.fetch_deps.clone(),
            extract_deps_raw: meta.extract_deps.clone(),
            patch_deps_raw: meta.patch_deps.clone(),
            build_deps_raw: meta.build_deps.clone(),
            lib_deps_raw: meta.lib_deps.clone(),
            run_deps_raw: meta.run_deps.clone(),
            flags: PackageFlags::default(),
            skip_reason: None,
            build_fingerprint: None,
            build_uuid: None,
        };

        let id = NodeId(self.packages.len());
        self.packages.push(package);
        self.index.insert(port_ref, id);

        // Recurse on each dependency kind's raw string, building edges
        // before this function returns so cyclic references resolve back
        // to the node already inserted above instead of recursing forever.
        let raw_by_kind = [
            (DependencyKind::Fetch, meta.fetch_deps),
            (DependencyKind::Extract, meta.extract_deps),
            (DependencyKind::Patch, meta.patch_deps),
            (DependencyKind::Build, meta.build_deps),
            (DependencyKind::Lib, meta.lib_deps),
            (DependencyKind::Run, meta.run_deps),
        ];

        for (kind, raw) in raw_by_kind {
            for origin in parse_dep_tokens(&raw) {
                let dep_id = self.get_or_create(origin)?;
                self.add_edge(id, dep_id, kind);
            }
        }

        Ok(id)
    }

    fn add_edge(&mut self, from: NodeId, to: NodeId, kind: DependencyKind) {
        if !self.seen_edges.insert((from, to, kind)) {
            return;
        }
        let edge = Edge { from, to, kind };
        self.forward.entry(from).or_default().push(edge);
        self.reverse.entry(to).or_default().push(edge);
    }

    fn propagate_ignored(&mut self) {
        let mut resolution_view = Resolution {
            packages: std::mem::take(&mut self.packages),
            forward: std::mem::take(&mut self.forward),
            reverse: std::mem::take(&mut self.reverse),
        };

        let ignored_roots: Vec<NodeId> = (0..resolution_view.node_count())
            .map(NodeId)
            .filter(|&id| resolution_view.get(id).ignore_reason.is_some())
            .collect();

        for id in &ignored_roots {
            resolution_view.get_mut(*id).flags.ignored = true;
        }

        let mut queue: std::collections::VecDeque<NodeId> = ignored_roots.into_iter().collect();
        let mut visited: HashSet<NodeId> = HashSet::new();
        while let Some(id) = queue.pop_front() {
            let ancestors: Vec<NodeId> = resolution_view
                .reverse
                .get(&id)
                .map(|edges| edges.iter().map(|e| e.from).collect())
                .unwrap_or_default();
            for anc in ancestors {
                if !visited.insert(anc) {
                    continue;
                }
                let pkg = resolution_view.get_mut(anc);
                if !pkg.flags.ignored {
                    pkg.flags.skipped_pre = true;
                    pkg.skip_reason = Some("dependency ignored".to_string());
                }
                queue.push_back(anc);
            }
        }

        self.packages = resolution_view.packages;
        self.forward = resolution_view.forward;
        self.reverse = resolution_view.reverse;
    }
}

/// Parses a raw dependency string into the origin `PortRef`s it references:
/// space-separated tokens of the form `pattern:origin[@flavor]`; the pattern
/// prefix is removed by splitting on the *last* `:` separator (a plain
/// `origin[@flavor]` token with no colon is accepted as-is).
pub fn parse_dep_tokens(raw: &str) -> Vec<PortRef> {
    raw.split_whitespace()
        .filter_map(|token| {
            let origin_part = match token.rsplit_once(':') {
                Some((_pattern, origin)) => origin,
                None => token,
            };
            PortRef::parse(origin_part)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PortMetadata;
    use std::cell::RefCell;
    use std::collections::HashMap as Map;

    struct MapMetadataQuery {
        entries: RefCell<Map<String, PortMetadata>>,
    }

    impl MetadataQuery for MapMetadataQuery {
        fn query(&self, port_dir: &str, flavor: Option<&str>) -> Result<PortMetadata> {
            let key = match flavor {
                Some(f) => format!("{port_dir}@{f}"),
                None => port_dir.to_string(),
            };
            self.entries
                .borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no fixture for {key}"))
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

    #[test]
    fn parses_pattern_prefixed_tokens() {
        let tokens = parse_dep_tokens("lib-depends:libs/libfoo gnome-glib>=2:devel/glib");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].port_dir(), "libs/libfoo");
        assert_eq!(tokens[1].port_dir(), "devel/glib");
    }

    #[test]
    fn builds_diamond_dependency_with_deduped_edges() {
        // app depends (build) on b and c; both b and c depend (build) on d.
        let mut entries = Map::new();
        entries.insert("apps/app".to_string(), meta("1.0", "libs/b libs/c"));
        entries.insert("libs/b".to_string(), meta("1.0", "libs/d"));
        entries.insert("libs/c".to_string(), meta("1.0", "libs/d"));
        entries.insert("libs/d".to_string(), meta("1.0", ""));
        let query = MapMetadataQuery {
            entries: RefCell::new(entries),
        };
        let resolver = Resolver::new(&query);
        let resolution = resolver.resolve(&["apps/app".to_string()]).unwrap();
        assert_eq!(resolution.node_count(), 4);

        let order = resolution.topo_strict().unwrap();
        let names: Vec<String> = order.iter().map(|&id| resolution.get(id).port_dir()).collect();
        let pos = |n: &str| names.iter().position(|x| x == n).unwrap();
        assert!(pos("libs/d") < pos("libs/b"));
        assert!(pos("libs/d") < pos("libs/c"));
        assert!(pos("libs/b") < pos("apps/app"));
        assert!(pos("libs/c") < pos("apps/app"));
    }

    #[test]
    fn detects_cycle_in_strict_order_but_permissive_still_orders_all() {
        let mut entries = Map::new();
        entries.insert("cat/a".to_string(), meta("1.0", "cat/b"));
        entries.insert("cat/b".to_string(), meta("1.0", "cat/a"));
        let query = MapMetadataQuery {
            entries: RefCell::new(entries),
        };
        let resolver = Resolver::new(&query);
        let resolution = resolver.resolve(&["cat/a".to_string()]).unwrap();

        let err = resolution.topo_strict().unwrap_err();
        assert_eq!(err.total_packages, 2);
        assert_eq!(err.cycle_packages.len(), 2);

        let permissive = resolution.topo_permissive();
        assert_eq!(permissive.len(), 2);
    }

    #[test]
    fn ignored_port_propagates_skipped_pre_to_ancestors() {
        let mut entries = Map::new();
        entries.insert("apps/app".to_string(), meta("1.0", "libs/bad"));
        let mut bad = meta("1.0", "");
        bad.ignore_reason = "does not build on this platform".to_string();
        entries.insert("libs/bad".to_string(), bad);
        let query = MapMetadataQuery {
            entries: RefCell::new(entries),
        };
        let resolver = Resolver::new(&query);
        let resolution = resolver.resolve(&["apps/app".to_string()]).unwrap();

        let app = resolution
            .packages
            .iter()
            .find(|p| p.port_dir() == "apps/app")
            .unwrap();
        assert!(app.flags.skipped_pre);
        assert_eq!(app.skip_reason.as_deref(), Some("dependency ignored"));

        let bad = resolution
            .packages
            .iter()
            .find(|p| p.port_dir() == "libs/bad")
            .unwrap();
        assert!(bad.flags.ignored);
    }
}
