//! Application — the per-root state machine: env assembly, restart
//! detection, and request admission onto a worker pool.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::response::Response;
use hyper::Request;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info};

use crate::config::Config;
use crate::env_sourcer::{self, SourceOptions};
use crate::errors::PowError;
use crate::pauser::Resume;
use crate::worker_pool::{PoolOptions, WorkerPool};

/// Lifecycle state: monotonic forward except for the
/// `Initializing -> Uninitialized` reset on initialization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplicationState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Per-root application: immutable root path, mutable lifecycle state.
pub struct Application {
    pub root: PathBuf,
    config: Arc<Config>,
    state: Mutex<ApplicationState>,
    ready_waiters: Mutex<VecDeque<oneshot::Sender<Result<(), Arc<PowError>>>>>,
    pool: Mutex<Option<WorkerPool>>,
    restart_mtime: Mutex<Option<SystemTime>>,
}

impl Application {
    pub fn new(root: PathBuf, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            root,
            config,
            state: Mutex::new(ApplicationState::Uninitialized),
            ready_waiters: Mutex::new(VecDeque::new()),
            pool: Mutex::new(None),
            restart_mtime: Mutex::new(None),
        })
    }

    /// If already ready, resolves immediately; otherwise joins
    /// `ready_waiters` and kicks off initialization if no other caller
    /// already has (re-entrancy guard: the state flip to `Initializing`
    /// happens before the initializer task is spawned, under the same lock
    /// a concurrent caller would also need).
    pub async fn ready(self: &Arc<Self>) -> Result<(), Arc<PowError>> {
        let mut state = self.state.lock().await;
        match *state {
            ApplicationState::Ready => return Ok(()),
            ApplicationState::Initializing => {
                drop(state);
                return self.join_waiters().await;
            }
            ApplicationState::Uninitialized => {
                *state = ApplicationState::Initializing;
                drop(state);
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_initialization().await });
                self.join_waiters().await
            }
        }
    }

    async fn join_waiters(&self) -> Result<(), Arc<PowError>> {
        let (tx, rx) = oneshot::channel();
        self.ready_waiters.lock().await.push_back(tx);
        rx.await.unwrap_or_else(|_| {
            Err(Arc::new(PowError::PoolError(
                "initialization task dropped without reporting a result".into(),
            )))
        })
    }

    async fn run_initialization(self: Arc<Self>) {
        let result = self.initialize_pipeline().await;

        let mut state = self.state.lock().await;
        let waiter_result: Result<(), Arc<PowError>> = match result {
            Ok(pool) => {
                *self.pool.lock().await = Some(pool);
                *state = ApplicationState::Ready;
                info!(root = %self.root.display(), "application ready");
                Ok(())
            }
            Err(err) => {
                *state = ApplicationState::Uninitialized;
                let err = Arc::new(err);
                error!(root = %self.root.display(), stdout = err.stdout(), stderr = err.stderr(), "initialization failed");
                Err(err)
            }
        };
        drop(state);

        // Drain in arrival order.
        let mut waiters = self.ready_waiters.lock().await;
        for waiter in waiters.drain(..) {
            let _ = waiter.send(waiter_result.clone());
        }
    }

    /// Sources the env scripts, then the rvm script if present, then hands
    /// the resulting environment to pool creation.
    async fn initialize_pipeline(&self) -> Result<WorkerPool, PowError> {
        let mut env = self.load_environment().await?;
        // Overrides the worker's own bind port so it reports the proxy's
        // port in self-generated URLs.
        env.insert("SERVER_PORT".to_string(), self.config.dst_port.to_string());
        let config_path = self.root.join("config.ru");
        WorkerPool::create(
            config_path,
            PoolOptions {
                env,
                size: self.config.workers.max(1),
                idle: self.config.timeout(),
            },
        )
        .await
    }

    async fn load_environment(&self) -> Result<HashMap<String, String>, PowError> {
        let mut env: HashMap<String, String> = std::env::vars().collect();

        for script_name in [".powrc", ".powenv"] {
            let script = self.root.join(script_name);
            if tokio::fs::try_exists(&script).await.unwrap_or(false) {
                env = env_sourcer::source(&script, &env, SourceOptions::default()).await?;
            }
        }

        let rvmrc = self.root.join(".rvmrc");
        if tokio::fs::try_exists(&rvmrc).await.unwrap_or(false) {
            let rvm_path = PathBuf::from(&self.config.rvm_path);
            if !tokio::fs::try_exists(&rvm_path).await.unwrap_or(false) {
                return Err(PowError::RvmMissing {
                    rvmrc: rvmrc.display().to_string(),
                    rvm_path: self.config.rvm_path.clone(),
                });
            }
            let before = format!(". {}", env_sourcer::shell_quote(&rvm_path));
            env = env_sourcer::source(
                &rvmrc,
                &env,
                SourceOptions {
                    before: Some(before),
                },
            )
            .await?;
        }

        Ok(env)
    }

    /// `resume` is the Request Pauser release function installed by the
    /// pipeline; released right before handoff to the pool so no response
    /// can begin before the request body is unblocked.
    pub async fn handle(
        self: &Arc<Self>,
        req: Request<Body>,
        resume: Resume,
    ) -> Result<Response, Arc<PowError>> {
        if let Err(err) = self.ready().await {
            resume.resume();
            return Err(err);
        }

        self.restart_if_necessary().await;

        // restart_if_necessary may have reset state back to Uninitialized;
        // re-check readiness so the caller always observes state = ready at
        // the moment of handoff rather than racing a draining pool.
        if let Err(err) = self.ready().await {
            resume.resume();
            return Err(err);
        }

        let pool = self.pool.lock().await.clone();
        let pool = match pool {
            Some(pool) => pool,
            None => {
                resume.resume();
                return Err(Arc::new(PowError::PoolError(
                    "pool unavailable despite ready state".into(),
                )));
            }
        };

        resume.resume();
        pool.handle(req).await.map_err(Arc::new)
    }

    /// Stats `tmp/restart.txt`; an mtime change from the last observed
    /// value triggers `quit`.
    pub async fn restart_if_necessary(self: &Arc<Self>) {
        let restart_file = self.root.join("tmp").join("restart.txt");
        let meta = tokio::fs::metadata(&restart_file).await;
        let (stat_ok, observed) = match &meta {
            Ok(m) => (true, m.modified().ok()),
            Err(_) => (false, None),
        };

        let mut restart_mtime = self.restart_mtime.lock().await;
        let changed = stat_ok && observed != *restart_mtime;
        *restart_mtime = observed;
        drop(restart_mtime);

        if changed {
            let observed_at = observed
                .map(|t| chrono::DateTime::<chrono::Local>::from(t).to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            info!(root = %self.root.display(), mtime = %observed_at, "restart.txt changed, quitting pool");
            self.quit().await;
        }
    }

    /// Only has an effect when `state = ready`; otherwise a no-op. Once the
    /// pool's terminal exit fires, the state is reset to `Uninitialized`
    /// immediately (rather than left at `Ready` with no pool), so the next
    /// `ready()` call re-initializes instead of observing a stale
    /// ready-with-no-pool state.
    pub async fn quit(self: &Arc<Self>) {
        let is_ready = matches!(*self.state.lock().await, ApplicationState::Ready);
        if !is_ready {
            return;
        }

        if let Some(pool) = self.pool.lock().await.take() {
            pool.quit().await;
        }

        let mut state = self.state.lock().await;
        if matches!(*state, ApplicationState::Ready) {
            *state = ApplicationState::Uninitialized;
        }
    }

    pub async fn is_ready(&self) -> bool {
        matches!(*self.state.lock().await, ApplicationState::Ready)
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pauser;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            workers: 2,
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn concurrent_ready_calls_join_one_initialization_and_drain_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::new(dir.path().to_path_buf(), test_config());

        // No `rackup` binary is present in the test environment, so
        // initialization deterministically fails during pool creation —
        // this still exercises the invariant under test: a single
        // initialization run serves every concurrent waiter, regardless of
        // whether that run succeeds.
        let mut handles = Vec::new();
        for _ in 0..10 {
            let app = app.clone();
            handles.push(tokio::spawn(async move { app.ready().await }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert!(results.iter().all(|r| r.is_err()));
        assert!(!app.is_ready().await);
    }

    #[tokio::test]
    async fn restart_if_necessary_is_a_no_op_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::new(dir.path().to_path_buf(), test_config());
        // Should not panic or attempt a quit when state isn't ready.
        app.restart_if_necessary().await;
        assert!(!app.is_ready().await);
    }

    #[tokio::test]
    async fn quit_on_non_ready_application_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::new(dir.path().to_path_buf(), test_config());
        app.quit().await;
        assert!(!app.is_ready().await);
    }

    #[tokio::test]
    async fn handle_releases_pause_even_on_init_failure() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::new(dir.path().to_path_buf(), test_config());

        let (body, resume) = pauser::pause(axum::body::Body::empty());
        let req = Request::builder()
            .uri("/")
            .body(axum::body::Body::new(body))
            .unwrap();

        let result = app.handle(req, resume.clone()).await;
        assert!(result.is_err());
        assert!(resume.is_resumed());
    }
}
