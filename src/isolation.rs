//! Isolation Environment (component E) — the abstract Setup/Execute/Cleanup
//! contract each worker drives, plus a registry of named backends.

use crate::error::{CleanupError, ExecError, SetupError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Propagates to every worker and every `Execute` call. Signal handling
/// (INT/TERM/HUP) triggers this from `main`; everything downstream only
/// ever observes it.
#[derive(Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    notify: Arc<(Mutex<()>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new((Mutex::new(()), Condvar::new())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let (_lock, cvar) = &*self.notify;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Blocks the calling thread until either cancellation fires or `dur`
    /// elapses, whichever is first. Used by `Execute`'s wait loop instead of
    /// a tight poll.
    pub fn wait_timeout(&self, dur: Duration) {
        if self.is_cancelled() {
            return;
        }
        let (lock, cvar) = &*self.notify;
        let guard = lock.lock().unwrap();
        let _ = cvar.wait_timeout(guard, dur);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct ExecCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ExecCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

pub struct ExecContext<'a> {
    pub cancellation: &'a CancellationToken,
    /// `None` or `Some(Duration::ZERO)` both mean "no timeout" — zero must
    /// never be read as an immediate timeout.
    pub timeout: Option<Duration>,
}

impl<'a> ExecContext<'a> {
    fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|d| !d.is_zero())
    }
}

/// Setup/Execute/Cleanup contract implemented by at least the real platform
/// backend and a deterministic mock.
pub trait IsolationEnvironment: Send {
    fn setup(&mut self, worker_id: usize) -> Result<PathBuf, SetupError>;
    fn execute(&mut self, ctx: &ExecContext, command: &ExecCommand) -> Result<ExecResult, ExecError>;
    fn cleanup(&mut self) -> Result<(), CleanupError>;
    fn base_path(&self) -> &Path;
}

/// Per-backend configuration, threaded in from `config.rs`.
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    pub build_base: PathBuf,
    pub isolation_helper: Option<String>,
    pub cancel_grace: Duration,
}

type BackendFactory = Box<dyn Fn(&IsolationConfig, usize) -> Box<dyn IsolationEnvironment> + Send + Sync>;

/// Resolves a named backend (the `useIsolationBackend` config key) to a
/// constructor closure.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("process", |config, worker_id| {
            Box::new(ProcessEnvironment::new(config.clone(), worker_id))
        });
        registry.register("mock", |config, worker_id| {
            Box::new(MockEnvironment::new(config.clone(), worker_id))
        });
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        factory: impl Fn(&IsolationConfig, usize) -> Box<dyn IsolationEnvironment> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn build(
        &self,
        backend: &str,
        config: &IsolationConfig,
        worker_id: usize,
    ) -> Result<Box<dyn IsolationEnvironment>, SetupError> {
        let factory = self.factories.get(backend).ok_or_else(|| SetupError::Failed {
            op: "resolve-backend",
            underlying: format!("no isolation backend registered under '{backend}'"),
        })?;
        Ok(factory(config, worker_id))
    }
}

/// In-memory backend for tests: never shells out, records every `execute`
/// invocation for assertions.
pub struct MockEnvironment {
    worker_id: usize,
    base_path: PathBuf,
    pub invocations: Vec<ExecCommand>,
    pub scripted_exit_codes: std::collections::VecDeque<i32>,
}

impl MockEnvironment {
    pub fn new(config: IsolationConfig, worker_id: usize) -> Self {
        Self {
            worker_id,
            base_path: config.build_base.join("mock").join(worker_id.to_string()),
            invocations: Vec::new(),
            scripted_exit_codes: std::collections::VecDeque::new(),
        }
    }

    pub fn script_exit_code(&mut self, code: i32) {
        self.scripted_exit_codes.push_back(code);
    }
}

impl IsolationEnvironment for MockEnvironment {
    fn setup(&mut self, worker_id: usize) -> Result<PathBuf, SetupError> {
        self.worker_id = worker_id;
        Ok(self.base_path.clone())
    }

    fn execute(&mut self, ctx: &ExecContext, command: &ExecCommand) -> Result<ExecResult, ExecError> {
        if ctx.cancellation.is_cancelled() {
            return Err(ExecError::Cancelled {
                op: "execute",
                cmd: command.program.clone(),
            });
        }
        self.invocations.push(command.clone());
        let exit_code = self.scripted_exit_codes.pop_front().unwrap_or(0);
        Ok(ExecResult {
            exit_code,
            duration: Duration::from_millis(0),
        })
    }

    fn cleanup(&mut self) -> Result<(), CleanupError> {
        Ok(())
    }

    fn base_path(&self) -> &Path {
        &self.base_path
    }
}

/// The real backend. Materializes a per-worker root, runs phase commands via
/// `std::process::Command`, and delegates the actual mount/chroot/overlay
/// wiring to an optional external helper program, keeping privileged setup
/// out of this process.
pub struct ProcessEnvironment {
    worker_id: usize,
    base_path: PathBuf,
    isolation_helper: Option<String>,
    cancel_grace: Duration,
    children: Vec<u32>,
}

impl ProcessEnvironment {
    pub fn new(config: IsolationConfig, worker_id: usize) -> Self {
        Self {
            worker_id,
            base_path: config.build_base.join("work").join(worker_id.to_string()),
            isolation_helper: config.isolation_helper,
            cancel_grace: config.cancel_grace,
            children: Vec::new(),
        }
    }

    fn run_helper(&self, verb: &str) -> Result<(), String> {
        let Some(helper) = &self.isolation_helper else {
            return Ok(());
        };
        let status = Command::new(helper)
            .arg(verb)
            .arg(&self.base_path)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| e.to_string())?;
        if !status.success() {
            return Err(format!("isolation helper '{helper} {verb}' exited with {status}"));
        }
        Ok(())
    }
}

impl IsolationEnvironment for ProcessEnvironment {
    fn setup(&mut self, worker_id: usize) -> Result<PathBuf, SetupError> {
        self.worker_id = worker_id;
        self.base_path = self.base_path.parent().unwrap_or(&self.base_path).join(worker_id.to_string());
        std::fs::create_dir_all(&self.base_path).map_err(|e| SetupError::Failed {
            op: "create-base-dir",
            underlying: e.to_string(),
        })?;
        self.run_helper("setup").map_err(|underlying| SetupError::Failed {
            op: "isolation-helper-setup",
            underlying,
        })?;
        Ok(self.base_path.clone())
    }

    fn execute(&mut self, ctx: &ExecContext, command: &ExecCommand) -> Result<ExecResult, ExecError> {
        if ctx.cancellation.is_cancelled() {
            return Err(ExecError::Cancelled {
                op: "execute",
                cmd: command.program.clone(),
            });
        }

        let started = Instant::now();
        let mut native = Command::new(&command.program);
        native
            .args(&command.args)
            .current_dir(&self.base_path)
            .stdin(Stdio::null());
        for (k, v) in &command.env {
            native.env(k, v);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            native.process_group(0);
        }

        let mut child = native.spawn().map_err(|e| ExecError::Failed {
            op: "spawn",
            cmd: command.program.clone(),
            underlying: e.to_string(),
        })?;
        self.children.push(child.id());

        let timeout = ctx.effective_timeout();
        loop {
            if let Some(status) = child.try_wait().map_err(|e| ExecError::Failed {
                op: "wait",
                cmd: command.program.clone(),
                underlying: e.to_string(),
            })? {
                return Ok(ExecResult {
                    exit_code: status.code().unwrap_or(-1),
                    duration: started.elapsed(),
                });
            }

            if ctx.cancellation.is_cancelled() {
                terminate_process_group(child.id(), self.cancel_grace);
                let _ = child.wait();
                return Err(ExecError::Cancelled {
                    op: "execute",
                    cmd: command.program.clone(),
                });
            }

            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    terminate_process_group(child.id(), self.cancel_grace);
                    let _ = child.wait();
                    return Err(ExecError::Timeout {
                        op: "execute",
                        cmd: command.program.clone(),
                    });
                }
            }

            ctx.cancellation.wait_timeout(Duration::from_millis(100));
        }
    }

    fn cleanup(&mut self) -> Result<(), CleanupError> {
        let mut reap_failed = false;
        for pid in self.children.drain(..) {
            if !terminate_process_group(pid, self.cancel_grace) {
                reap_failed = true;
            }
        }

        if let Err(underlying) = self.run_helper("cleanup") {
            tracing::warn!(worker_id = self.worker_id, %underlying, "isolation helper cleanup failed, retrying once");
            if let Err(underlying) = self.run_helper("cleanup") {
                tracing::warn!(worker_id = self.worker_id, %underlying, "isolation helper cleanup failed after retry");
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&self.base_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(worker_id = self.worker_id, error = %e, "failed to remove worker base directory");
            }
        }

        if reap_failed {
            return Err(CleanupError::ReapTimedOut {
                worker_id: self.worker_id,
            });
        }
        Ok(())
    }

    fn base_path(&self) -> &Path {
        &self.base_path
    }
}

/// Sends SIGTERM to the process group, waits up to `grace`, then escalates
/// to SIGKILL. Returns `false` if the group could not be confirmed dead
/// within the grace window (still attempts SIGKILL regardless).
fn terminate_process_group(pid: u32, grace: Duration) -> bool {
    let pgid = pid as libc::pid_t;
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        let rc = unsafe { libc::kill(-pgid, 0) };
        if rc != 0 {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &Path) -> IsolationConfig {
        IsolationConfig {
            build_base: base.to_path_buf(),
            isolation_helper: None,
            cancel_grace: Duration::from_millis(200),
        }
    }

    #[test]
    fn mock_environment_records_invocations_and_never_shells_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = MockEnvironment::new(config(dir.path()), 0);
        env.setup(0).unwrap();
        let token = CancellationToken::new();
        let ctx = ExecContext {
            cancellation: &token,
            timeout: None,
        };
        let result = env
            .execute(&ctx, &ExecCommand::new("fake-build-tool").arg("all"))
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(env.invocations.len(), 1);
        assert_eq!(env.invocations[0].program, "fake-build-tool");
    }

    #[test]
    fn mock_environment_respects_scripted_failure_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = MockEnvironment::new(config(dir.path()), 0);
        env.script_exit_code(1);
        let token = CancellationToken::new();
        let ctx = ExecContext {
            cancellation: &token,
            timeout: None,
        };
        let result = env.execute(&ctx, &ExecCommand::new("false")).unwrap();
        assert_eq!(result.exit_code, 1);
    }

    #[test]
    fn cancelled_token_short_circuits_execute() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = MockEnvironment::new(config(dir.path()), 0);
        let token = CancellationToken::new();
        token.cancel();
        let ctx = ExecContext {
            cancellation: &token,
            timeout: None,
        };
        let err = env.execute(&ctx, &ExecCommand::new("anything")).unwrap_err();
        assert!(matches!(err, ExecError::Cancelled { .. }));
    }

    #[test]
    fn backend_registry_resolves_known_backends_and_rejects_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BackendRegistry::with_defaults();
        let cfg = config(dir.path());
        assert!(registry.build("mock", &cfg, 0).is_ok());
        assert!(registry.build("process", &cfg, 0).is_ok());
        assert!(registry.build("nonexistent", &cfg, 0).is_err());
    }

    #[test]
    fn process_environment_runs_a_real_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = ProcessEnvironment::new(config(dir.path()), 0);
        env.setup(0).unwrap();
        let token = CancellationToken::new();
        let ctx = ExecContext {
            cancellation: &token,
            timeout: Some(Duration::from_secs(5)),
        };
        let result = env.execute(&ctx, &ExecCommand::new("true")).unwrap();
        assert_eq!(result.exit_code, 0);
        env.cleanup().unwrap();
    }

    #[test]
    fn zero_timeout_means_no_timeout() {
        let ctx = ExecContext {
            cancellation: &CancellationToken::new(),
            timeout: Some(Duration::ZERO),
        };
        assert_eq!(ctx.effective_timeout(), None);
    }
}
