//! Worker-Pool Adapter — a thin contract around the external worker-pool
//! primitive, plus a concrete subprocess-backed implementation so the
//! crate is runnable standalone.
//!
//! Each worker is a `rackup`-style process (the same invocation the real
//! `pow` daemon uses to boot a Rack app) bound to a private TCP port; the
//! pool proxies HTTP requests to whichever worker is free, spawning new
//! workers up to `size` on demand and idling one out after a period of
//! inactivity.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::response::Response;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tracing::{info, warn};

use crate::errors::PowError;
use crate::line_buffer;

/// Observable pool events: worker-spawn, worker-exit, and a terminal `exit`
/// once every worker has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    WorkerSpawn(u32),
    WorkerExit(u32),
    Exit,
}

/// Options accepted by [`WorkerPool::create`]: `{env, size, idle}`.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub env: HashMap<String, String>,
    pub size: usize,
    pub idle: Duration,
}

struct Worker {
    child: Child,
    pid: u32,
    port: u16,
    busy: bool,
    last_used: Instant,
}

struct PoolInner {
    app_dir: PathBuf,
    config_path: PathBuf,
    options: PoolOptions,
    workers: AsyncMutex<Vec<Worker>>,
    free_notify: Notify,
    next_port: AtomicU16,
    quitting: AtomicBool,
    events: broadcast::Sender<PoolEvent>,
    client: Client<HttpConnector, Body>,
}

/// A running pool of worker subprocesses for one [`Application`](crate::application::Application).
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Spawns the first worker eagerly; the rest spawn lazily in
    /// [`handle`](Self::handle). Also starts the idle-reaper task that
    /// periodically retires workers unused past `options.idle`.
    pub async fn create(config_path: PathBuf, options: PoolOptions) -> Result<Self, PowError> {
        let app_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let (events, _rx) = broadcast::channel(32);
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let inner = Arc::new(PoolInner {
            app_dir,
            config_path,
            options,
            workers: AsyncMutex::new(Vec::new()),
            free_notify: Notify::new(),
            next_port: AtomicU16::new(0),
            quitting: AtomicBool::new(false),
            events,
            client,
        });

        let pool = WorkerPool { inner };
        pool.spawn_worker().await?;
        pool.spawn_idle_reaper();
        Ok(pool)
    }

    /// Background task that periodically retires workers idle past
    /// `options.idle`, checking on a fraction of the idle window so a
    /// worker isn't kept around much longer than it needs to be. Exits once
    /// `quit()` has flipped the quitting flag.
    fn spawn_idle_reaper(&self) {
        let pool = self.clone();
        let check_every = (pool.inner.options.idle / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_every);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if pool.inner.quitting.load(Ordering::Acquire) {
                    break;
                }
                pool.reap_idle().await;
            }
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Hand the request to an available worker, spawning a new one (up to
    /// `size`) or queuing on busy workers otherwise.
    pub async fn handle(&self, req: Request<Body>) -> Result<Response, PowError> {
        let port = loop {
            if let Some(port) = self.acquire_idle_worker().await? {
                break port;
            }
            // All workers busy and at capacity: queue until one frees up.
            self.inner.free_notify.notified().await;
        };

        let result = self.proxy_to(port, req).await;
        self.release_worker(port).await;
        result
    }

    async fn acquire_idle_worker(&self) -> Result<Option<u16>, PowError> {
        let mut workers = self.inner.workers.lock().await;
        if let Some(worker) = workers.iter_mut().find(|w| !w.busy) {
            worker.busy = true;
            worker.last_used = Instant::now();
            return Ok(Some(worker.port));
        }
        if workers.len() < self.inner.options.size {
            drop(workers);
            let port = self.spawn_worker().await?;
            let mut workers = self.inner.workers.lock().await;
            if let Some(worker) = workers.iter_mut().find(|w| w.port == port) {
                worker.busy = true;
                worker.last_used = Instant::now();
            }
            return Ok(Some(port));
        }
        Ok(None)
    }

    async fn release_worker(&self, port: u16) {
        let mut workers = self.inner.workers.lock().await;
        if let Some(worker) = workers.iter_mut().find(|w| w.port == port) {
            worker.busy = false;
            worker.last_used = Instant::now();
        }
        drop(workers);
        self.inner.free_notify.notify_one();
    }

    async fn proxy_to(&self, port: u16, mut req: Request<Body>) -> Result<Response, PowError> {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let uri = format!(
            "http://{addr}{}",
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );
        *req.uri_mut() = uri.parse().map_err(|e| PowError::PoolError(format!("{e}")))?;

        self.inner
            .client
            .request(req)
            .await
            .map(|resp| resp.map(Body::new))
            .map_err(|e| PowError::PoolError(format!("upstream worker error: {e}")))
    }

    async fn spawn_worker(&self) -> Result<u16, PowError> {
        let port = self.allocate_port().await?;
        let pid;
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(format!(
                    "exec rackup --host 127.0.0.1 --port {port} {}",
                    self.inner.config_path.display()
                ))
                .current_dir(&self.inner.app_dir)
                .env_clear()
                .envs(&self.inner.options.env)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd.spawn().map_err(|e| {
                PowError::PoolError(format!("failed to spawn worker: {e}"))
            })?;
            pid = child.id().unwrap_or(0);

            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(async move {
                    line_buffer::forward_lines(stdout, |line| info!(worker = pid, "{line}")).await;
                });
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(async move {
                    line_buffer::forward_lines(stderr, |line| warn!(worker = pid, "{line}")).await;
                });
            }

            let mut workers = self.inner.workers.lock().await;
            workers.push(Worker {
                child,
                pid,
                port,
                busy: false,
                last_used: Instant::now(),
            });
        }
        let _ = self.inner.events.send(PoolEvent::WorkerSpawn(pid));
        info!(worker = pid, port, "worker spawned");
        Ok(port)
    }

    /// Bind an ephemeral port, then drop the listener so the worker process
    /// can bind it itself — racy in theory, fine in practice for a local
    /// dev proxy, same tradeoff the real daemon makes.
    async fn allocate_port(&self) -> Result<u16, PowError> {
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", 0)).await {
            if let Ok(addr) = listener.local_addr() {
                return Ok(addr.port());
            }
        }
        // Fallback: sequential assignment starting above the registered range.
        Ok(self.inner.next_port.fetch_add(1, Ordering::SeqCst) + 20600)
    }

    /// Idle-out workers unused for longer than `options.idle`. Honored
    /// entirely by the adapter — a reaped worker does not affect the
    /// owning `Application`'s state.
    pub async fn reap_idle(&self) {
        let idle_after = self.inner.options.idle;
        let mut workers = self.inner.workers.lock().await;
        let mut remaining = Vec::with_capacity(workers.len());
        for mut worker in workers.drain(..) {
            if !worker.busy && worker.last_used.elapsed() >= idle_after {
                let pid = worker.pid;
                tokio::spawn(async move {
                    terminate_gracefully(&mut worker.child, pid).await;
                });
                info!(worker = pid, "worker idled out");
            } else {
                remaining.push(worker);
            }
        }
        *workers = remaining;
    }

    /// Drains and terminates all workers, then fires the terminal `Exit`
    /// event once every worker has exited. Quit errors are silenced. Each
    /// worker is asked to exit cleanly (`SIGTERM`) before being forced
    /// (`SIGKILL`) if it doesn't within a short grace period, so a
    /// well-behaved Rack app gets a chance to flush.
    pub async fn quit(&self) {
        self.inner.quitting.store(true, Ordering::Release);
        let mut workers = self.inner.workers.lock().await;
        for mut worker in workers.drain(..) {
            let pid = worker.pid;
            terminate_gracefully(&mut worker.child, pid).await;
            let _ = self.inner.events.send(PoolEvent::WorkerExit(pid));
        }
        drop(workers);
        let _ = self.inner.events.send(PoolEvent::Exit);
    }
}

/// Send `SIGTERM`, give the worker a grace period to exit on its own, then
/// fall back to `SIGKILL` (`Child::start_kill`) if it's still alive.
async fn terminate_gracefully(child: &mut Child, pid: u32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    let graceful = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
    if graceful.is_err() {
        warn!(worker = pid, "worker ignored SIGTERM, sending SIGKILL");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_event_variants_are_distinguishable() {
        assert_ne!(PoolEvent::WorkerSpawn(1), PoolEvent::WorkerExit(1));
        assert_eq!(PoolEvent::Exit, PoolEvent::Exit);
    }
}
