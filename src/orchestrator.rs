//! Build Orchestrator (component F) — drives the planned set to terminal
//! status with a worker pool over isolated environments, enforcing per-port
//! phase discipline, cancellation, and transactional database updates.

use crate::db::{BuildRecord, BuildStatus, Database};
use crate::error::{CoreError, ExecError};
use crate::events::{Event, Observer, StatsSnapshot};
use crate::isolation::{
    BackendRegistry, CancellationToken, ExecCommand, ExecContext, IsolationConfig,
    IsolationEnvironment,
};
use crate::planner::{Plan, PlanLabel};
use crate::resolver::{NodeId, Resolution};
use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
enum Phase {
    ReserveUuid,
    PreRecord,
    Fetch,
    Extract,
    Patch,
    Configure,
    Build,
    Stage,
    Package,
    InstallIntoEnv,
    PostRecord,
}

impl Phase {
    const SHELLED: [Phase; 8] = [
        Phase::Fetch,
        Phase::Extract,
        Phase::Patch,
        Phase::Configure,
        Phase::Build,
        Phase::Stage,
        Phase::Package,
        Phase::InstallIntoEnv,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Phase::ReserveUuid => "reserve-uuid",
            Phase::PreRecord => "pre-record",
            Phase::Fetch => "fetch",
            Phase::Extract => "extract",
            Phase::Patch => "patch",
            Phase::Configure => "configure",
            Phase::Build => "build",
            Phase::Stage => "stage",
            Phase::Package => "package",
            Phase::InstallIntoEnv => "install-into-env",
            Phase::PostRecord => "post-record",
        }
    }
}

/// Whether a finished package satisfies a downstream build/lib dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Good,
    Bad,
}

/// Optional dynamic throttle input (load average, swap pressure, ...). Can
/// only lower the effective worker cap below *W*, never raise it.
pub trait SystemMetricsSource: Send + Sync {
    fn suggested_cap(&self, max_workers: usize) -> usize;
}

pub struct OrchestratorConfig {
    pub workers: usize,
    pub slow_start: Duration,
    pub per_execute_timeout: Option<Duration>,
    pub cancel_grace: Duration,
    pub isolation_backend: String,
    pub build_base: std::path::PathBuf,
    pub isolation_helper: Option<String>,
    /// The external host port-build tool: invoked as
    /// `<build_command> <phase> <portDir>`.
    pub build_command: String,
    pub run_id: String,
}

pub struct Orchestrator<'a> {
    db: &'a Database,
    ports_dir: &'a std::path::Path,
    observer: &'a dyn Observer,
    registry: BackendRegistry,
    config: OrchestratorConfig,
    metrics_source: Option<Arc<dyn SystemMetricsSource>>,
}

#[derive(Debug, Default, Clone)]
struct Stats {
    total: usize,
    success: usize,
    failed: usize,
    skipped: usize,
    skipped_pre: usize,
    ignored: usize,
    duration: Duration,
}

impl From<Stats> for StatsSnapshot {
    fn from(s: Stats) -> Self {
        StatsSnapshot {
            total: s.total,
            success: s.success,
            failed: s.failed,
            skipped: s.skipped,
            skipped_pre: s.skipped_pre,
            ignored: s.ignored,
            duration_ms: s.duration.as_millis() as u64,
        }
    }
}

struct Shared {
    resolution: Resolution,
    completion: Mutex<HashMap<NodeId, Readiness>>,
    condvar: Condvar,
    stats: Mutex<Stats>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        db: &'a Database,
        ports_dir: &'a std::path::Path,
        observer: &'a dyn Observer,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            ports_dir,
            observer,
            registry: BackendRegistry::with_defaults(),
            config,
            metrics_source: None,
        }
    }

    pub fn with_metrics_source(mut self, source: Arc<dyn SystemMetricsSource>) -> Self {
        self.metrics_source = Some(source);
        self
    }

    pub fn with_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn run(
        &self,
        resolution: Resolution,
        plan: &Plan,
        cancellation: CancellationToken,
    ) -> Result<StatsSnapshot, CoreError> {
        let run_started = Instant::now();
        self.observer.on_event(Event::RunStarted {
            run_id: self.config.run_id.clone(),
        });

        let shared = Arc::new(Shared {
            resolution,
            completion: Mutex::new(HashMap::new()),
            condvar: Condvar::new(),
            stats: Mutex::new(Stats::default()),
        });

        // Pre-resolve every terminal-before-the-run label so the feeder and
        // workers can gate purely on the completion map.
        for planned in &plan.order {
            let port_dir = shared.resolution.get(planned.id).port_dir();
            let mut stats = shared.stats.lock().unwrap();
            stats.total += 1;
            match planned.label {
                PlanLabel::Ignored => {
                    stats.ignored += 1;
                    drop(stats);
                    shared
                        .completion
                        .lock()
                        .unwrap()
                        .insert(planned.id, Readiness::Bad);
                    self.observer.on_event(Event::PortSkipped {
                        port_dir,
                        reason: "ignored".to_string(),
                    });
                }
                PlanLabel::SkippedPre => {
                    stats.skipped_pre += 1;
                    drop(stats);
                    shared
                        .completion
                        .lock()
                        .unwrap()
                        .insert(planned.id, Readiness::Bad);
                    self.observer.on_event(Event::PortSkipped {
                        port_dir,
                        reason: "dependency ignored".to_string(),
                    });
                }
                PlanLabel::UpToDate => {
                    // Unchanged fingerprint: spec.md has no separate category
                    // for this, it's a plan-skip like any other SkippedPre.
                    stats.skipped_pre += 1;
                    drop(stats);
                    shared
                        .completion
                        .lock()
                        .unwrap()
                        .insert(planned.id, Readiness::Good);
                    self.observer.on_event(Event::PortSkipped {
                        port_dir,
                        reason: "unchanged".to_string(),
                    });
                }
                PlanLabel::NeedsBuild => {
                    drop(stats);
                    self.observer.on_event(Event::PortQueued { port_dir });
                }
            }
        }

        let to_build: Vec<NodeId> = plan.enqueueable().collect();
        let capacity = self.config.workers.max(1);
        let (tx, rx) = bounded::<NodeId>(capacity);

        let throttle_cap = Arc::new(AtomicUsize::new(self.config.workers.max(1)));
        let run_finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let throttle_handle = self.metrics_source.clone().map(|source| {
            spawn_throttle_thread(
                self.config.workers.max(1),
                cancellation.clone(),
                run_finished.clone(),
                throttle_cap.clone(),
                source,
            )
        });

        // Workers borrow `self.db`/`self.observer`/`self.ports_dir` directly
        // (lifetime `'a`), so the whole fan-out runs inside one
        // `thread::scope`: the scope's implicit join at the end guarantees
        // those borrows outlive every thread that uses them.
        std::thread::scope(|scope| -> Result<(), CoreError> {
            let feeder_shared = shared.clone();
            let feeder_cancellation = cancellation.clone();
            let feeder_queue = to_build.clone();
            scope.spawn(move || {
                feed(feeder_shared, feeder_queue, tx, feeder_cancellation);
            });

            for worker_id in 0..self.config.workers.max(1) {
                if worker_id > 0 && !self.config.slow_start.is_zero() {
                    std::thread::sleep(self.config.slow_start);
                }
                let rx = rx.clone();
                let shared = shared.clone();
                let cancellation = cancellation.clone();
                let isolation_config = IsolationConfig {
                    build_base: self.config.build_base.clone(),
                    isolation_helper: self.config.isolation_helper.clone(),
                    cancel_grace: self.config.cancel_grace,
                };
                let mut env = self
                    .registry
                    .build(&self.config.isolation_backend, &isolation_config, worker_id)
                    .map_err(|e| CoreError::Config(e.to_string()))?;
                let db = self.db;
                let ports_dir = self.ports_dir;
                let build_command = self.config.build_command.clone();
                let per_execute_timeout = self.config.per_execute_timeout;
                let observer = self.observer;
                let throttle_cap = throttle_cap.clone();

                scope.spawn(move || {
                    env.setup(worker_id).ok();
                    loop {
                        if worker_id >= throttle_cap.load(Ordering::Relaxed) {
                            std::thread::sleep(Duration::from_millis(200));
                            continue;
                        }
                        match rx.recv_timeout(Duration::from_millis(200)) {
                            Ok(node_id) => {
                                run_package(
                                    &shared,
                                    node_id,
                                    db,
                                    ports_dir,
                                    env.as_mut(),
                                    &build_command,
                                    per_execute_timeout,
                                    &cancellation,
                                    observer,
                                );
                            }
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    let _ = env.cleanup();
                });
            }

            Ok(())
        })?;

        run_finished.store(true, Ordering::SeqCst);
        if let Some(handle) = throttle_handle {
            handle.join().ok();
        }

        let mut stats = shared.stats.lock().unwrap().clone();
        stats.duration = run_started.elapsed();
        let snapshot: StatsSnapshot = stats.into();
        self.observer.on_event(Event::RunFinished {
            run_id: self.config.run_id.clone(),
            stats: snapshot.clone(),
        });
        Ok(snapshot)
    }
}

fn spawn_throttle_thread(
    max_workers: usize,
    cancellation: CancellationToken,
    run_finished: Arc<std::sync::atomic::AtomicBool>,
    cap: Arc<AtomicUsize>,
    source: Arc<dyn SystemMetricsSource>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        loop {
            if cancellation.is_cancelled() || run_finished.load(Ordering::SeqCst) {
                return;
            }
            let suggested = source.suggested_cap(max_workers).min(max_workers).max(1);
            cap.store(suggested, Ordering::Relaxed);
            cancellation.wait_timeout(Duration::from_secs(1));
        }
    })
}

fn feed(
    shared: Arc<Shared>,
    queue: Vec<NodeId>,
    tx: crossbeam_channel::Sender<NodeId>,
    cancellation: CancellationToken,
) {
    for node_id in queue {
        if cancellation.is_cancelled() {
            break;
        }
        loop {
            if cancellation.is_cancelled() {
                return;
            }
            let predecessors_ready = {
                let completion = shared.completion.lock().unwrap();
                gating_predecessors(&shared.resolution, node_id)
                    .into_iter()
                    .all(|dep| completion.contains_key(&dep))
            };
            if !predecessors_ready {
                let guard = shared.completion.lock().unwrap();
                let _ = shared
                    .condvar
                    .wait_timeout(guard, Duration::from_millis(100));
                continue;
            }

            let any_bad = {
                let completion = shared.completion.lock().unwrap();
                gating_predecessors(&shared.resolution, node_id)
                    .into_iter()
                    .any(|dep| completion.get(&dep) == Some(&Readiness::Bad))
            };
            if any_bad {
                shared
                    .completion
                    .lock()
                    .unwrap()
                    .insert(node_id, Readiness::Bad);
                let mut stats = shared.stats.lock().unwrap();
                stats.skipped += 1;
                shared.condvar.notify_all();
                break;
            }

            if tx.send(node_id).is_err() {
                return;
            }
            break;
        }
    }
}

fn gating_predecessors(resolution: &Resolution, node_id: NodeId) -> Vec<NodeId> {
    resolution
        .forward
        .get(&node_id)
        .map(|edges| {
            edges
                .iter()
                .filter(|e| e.kind.gates_enqueue())
                .map(|e| e.to)
                .collect()
        })
        .unwrap_or_default()
}

#[allow(clippy::too_many_arguments)]
fn run_package(
    shared: &Arc<Shared>,
    node_id: NodeId,
    db: &Database,
    ports_dir: &std::path::Path,
    env: &mut dyn IsolationEnvironment,
    build_command: &str,
    per_execute_timeout: Option<Duration>,
    cancellation: &CancellationToken,
    observer: &dyn Observer,
) {
    let (port_dir, version) = {
        let pkg = shared.resolution.get(node_id);
        (pkg.port_dir(), pkg.version.clone())
    };
    let has_dependents = shared
        .resolution
        .reverse
        .get(&node_id)
        .map(|edges| !edges.is_empty())
        .unwrap_or(false);

    let uuid = Uuid::new_v4();

    if let Err(e) = db.save_record(&BuildRecord::start(uuid, port_dir.clone(), version.clone())) {
        finish(shared, node_id, Readiness::Bad, observer, &port_dir, "failed");
        observer.on_event(Event::PortFailed {
            port_dir,
            phase: Phase::PreRecord.as_str().to_string(),
            reason: e.to_string(),
        });
        return;
    }

    let mut failure: Option<(Phase, String)> = None;
    for phase in Phase::SHELLED {
        if phase == Phase::InstallIntoEnv && !has_dependents {
            continue;
        }
        observer.on_event(Event::PortPhaseStarted {
            port_dir: port_dir.clone(),
            phase: phase.as_str().to_string(),
        });
        let ctx = ExecContext {
            cancellation,
            timeout: per_execute_timeout,
        };
        let command = ExecCommand::new(build_command)
            .arg(phase.as_str())
            .arg(&port_dir)
            .env("PORTDIR", &port_dir)
            .env("PKGVERSION", &version);
        match env.execute(&ctx, &command) {
            Ok(result) => {
                observer.on_event(Event::PortPhaseFinished {
                    port_dir: port_dir.clone(),
                    phase: phase.as_str().to_string(),
                    exit_code: result.exit_code,
                });
                if result.exit_code != 0 {
                    failure = Some((phase, format!("exit code {}", result.exit_code)));
                    break;
                }
            }
            Err(e) => {
                failure = Some((phase, describe_exec_error(&e)));
                break;
            }
        }
    }

    let ended = Utc::now();
    match failure {
        None => {
            let crc = shared.resolution.get(node_id).build_fingerprint;
            let _ = db.update_record_status(uuid, BuildStatus::Success, ended);
            if let Some(crc) = crc {
                let _ = db.update_crc(&port_dir, crc);
            }
            let _ = db.update_package_index(&port_dir, &version, uuid);
            finish(shared, node_id, Readiness::Good, observer, &port_dir, "success");
            observer.on_event(Event::PortSucceeded { port_dir });
        }
        Some((phase, reason)) => {
            let _ = db.update_record_status(uuid, BuildStatus::Failed, ended);
            finish(shared, node_id, Readiness::Bad, observer, &port_dir, "failed");
            observer.on_event(Event::PortFailed {
                port_dir,
                phase: phase.as_str().to_string(),
                reason,
            });
        }
    }
}

fn describe_exec_error(e: &ExecError) -> String {
    e.to_string()
}

fn finish(
    shared: &Arc<Shared>,
    node_id: NodeId,
    readiness: Readiness,
    _observer: &dyn Observer,
    _port_dir: &str,
    outcome: &str,
) {
    shared.completion.lock().unwrap().insert(node_id, readiness);
    {
        let mut stats = shared.stats.lock().unwrap();
        match outcome {
            "success" => stats.success += 1,
            "failed" => stats.failed += 1,
            _ => {}
        }
    }
    shared.condvar.notify_all();
}
