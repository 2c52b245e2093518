//! Backend subprocess lifecycle.
//!
//! Each loaded model is served by an independent backend process bound to a
//! loopback port.  This module spawns the binary implied by the model's
//! recipe, captures its stdio into the log, polls its health endpoint until
//! ready, and shuts it down gracefully (terminate, grace period, hard kill).
//!
//! The pool talks to backends through the [`Launcher`] and [`BackendHandle`]
//! seams so the load/evict machinery can be exercised without real
//! subprocesses.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::catalog::ModelDescriptor;
use crate::error::ServeError;
use crate::recipe::{ModelClass, Recipe, RecipeOptions};

/// Poll interval for the readiness probe, at most 10 Hz.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[async_trait]
pub trait BackendHandle: Send + Sync {
    fn port(&self) -> u16;

    /// Platform check distinguishing a running process from an exited or
    /// zombie one.
    async fn is_alive(&self) -> bool;

    /// Graceful shutdown; hard-kills after `grace`.
    async fn stop(&self, grace: Duration);
}

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn a backend for `descriptor` on `port` and wait until it answers
    /// its health endpoint, within `timeout`.
    async fn launch(
        &self,
        descriptor: &ModelDescriptor,
        options: &RecipeOptions,
        port: u16,
        timeout: Duration,
    ) -> Result<Arc<dyn BackendHandle>, ServeError>;
}

/// The production launcher: real subprocesses probed over loopback HTTP.
pub struct ProcessLauncher {
    http: reqwest::Client,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("loopback http client");
        Self { http }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        descriptor: &ModelDescriptor,
        options: &RecipeOptions,
        port: u16,
        timeout: Duration,
    ) -> Result<Arc<dyn BackendHandle>, ServeError> {
        let process = BackendProcess::spawn(descriptor, options, port)?;
        if let Err(e) = process.wait_ready(&self.http, timeout).await {
            process.stop(Duration::from_secs(2)).await;
            return Err(e);
        }
        Ok(Arc::new(process))
    }
}

/// One running backend subprocess.
pub struct BackendProcess {
    name: String,
    port: u16,
    pid: u32,
    child: Mutex<Option<Child>>,
}

impl BackendProcess {
    /// Spawn the backend binary for `descriptor` with arguments derived from
    /// the effective options.  stdout and stderr are drained into debug logs
    /// tagged with the model name.
    pub fn spawn(
        descriptor: &ModelDescriptor,
        options: &RecipeOptions,
        port: u16,
    ) -> Result<Self, ServeError> {
        let name = descriptor.name.clone();
        let binary = backend_binary(descriptor.recipe, options)?;
        let args = build_args(descriptor, options, port)?;

        info!(
            model = %name,
            binary = %binary.display(),
            port,
            options = %options.to_log_string(),
            "Spawning backend"
        );

        let mut child = Command::new(&binary)
            .args(&args)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ServeError::LoadFailed {
                model: name.clone(),
                reason: format!("failed to spawn {}: {e}", binary.display()),
            })?;

        let pid = child.id().unwrap_or(0);
        if let Some(stdout) = child.stdout.take() {
            drain_stdio(name.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            drain_stdio(name.clone(), "stderr", stderr);
        }

        Ok(Self {
            name,
            port,
            pid,
            child: Mutex::new(Some(child)),
        })
    }

    /// Poll `GET /health` on the local port until 2xx or `timeout`.  An early
    /// process exit fails immediately instead of waiting out the deadline.
    pub async fn wait_ready(
        &self,
        http: &reqwest::Client,
        timeout: Duration,
    ) -> Result<(), ServeError> {
        let url = format!("http://127.0.0.1:{}/health", self.port);
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            if let Ok(resp) = http.get(&url).send().await {
                if resp.status().is_success() {
                    info!(model = %self.name, port = self.port, "Backend is ready");
                    return Ok(());
                }
            }

            let mut child = self.child.lock().await;
            if let Some(ref mut proc) = *child {
                match proc.try_wait() {
                    Ok(Some(exit)) => {
                        let reason = format!("backend exited early with status {exit}");
                        error!(model = %self.name, "{reason}");
                        return Err(ServeError::LoadFailed {
                            model: self.name.clone(),
                            reason,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        return Err(ServeError::LoadFailed {
                            model: self.name.clone(),
                            reason: format!("failed to poll backend process: {e}"),
                        });
                    }
                }
            }
            drop(child);

            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }

        Err(ServeError::LoadFailed {
            model: self.name.clone(),
            reason: format!(
                "backend did not become healthy within {}s",
                timeout.as_secs()
            ),
        })
    }
}

#[async_trait]
impl BackendHandle for BackendProcess {
    fn port(&self) -> u16 {
        self.port
    }

    async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        match *child {
            Some(ref mut proc) => match proc.try_wait() {
                Ok(Some(_)) | Err(_) => false,
                Ok(None) => !is_zombie(self.pid),
            },
            None => false,
        }
    }

    /// Graceful terminate first, wait up to `grace`, then hard kill.
    async fn stop(&self, grace: Duration) {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return;
        };
        info!(model = %self.name, port = self.port, "Stopping backend");

        terminate(&child);

        let deadline = Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(model = %self.name, code = status.code(), "Backend exited");
                    return;
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!(model = %self.name, "Grace period expired, killing backend");
                        let _ = child.kill().await;
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Err(e) => {
                    error!(model = %self.name, "Error waiting for backend: {e}");
                    let _ = child.kill().await;
                    return;
                }
            }
        }
    }
}

fn drain_stdio(
    model: String,
    stream: &'static str,
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "backend", model = %model, stream, "{line}");
        }
    });
}

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        // SIGTERM lets the backend flush and release its port.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        debug!(pid, "Sent SIGTERM");
    }
}

#[cfg(not(unix))]
fn terminate(child: &Child) {
    // No graceful signal on Windows; the grace loop falls through to kill().
    let _ = child.id();
}

/// Zombie detection.  A reparented or reaped process is gone; a zombie still
/// has a pid but serves nothing.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // State is the first field after the parenthesized command name.
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .map(|state| state == 'Z')
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(pid: u32) -> bool {
    // kill(pid, 0) cannot distinguish zombies; try_wait above already reaps
    // exited children, so treat a signalable pid as alive.
    unsafe { libc::kill(pid as i32, 0) != 0 }
}

#[cfg(not(unix))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Resolve the backend executable for a recipe: env override, well-known
/// install locations, then PATH lookup by bare name.
fn backend_binary(recipe: Recipe, options: &RecipeOptions) -> Result<PathBuf, ServeError> {
    let env_key = format!(
        "MODELD_{}_BIN",
        recipe.as_str().to_uppercase().replace('-', "_")
    );
    if let Ok(path) = std::env::var(&env_key) {
        let path = PathBuf::from(&path);
        if path.exists() {
            return Ok(path);
        }
        warn!("{env_key}={} does not exist, falling back", path.display());
    }

    let mut candidates: Vec<String> = Vec::new();
    if recipe == Recipe::LlamaCpp {
        // Backend flavor builds are installed side by side, e.g.
        // llama-server-vulkan next to llama-server.
        let flavor = options.get_text("llamacpp_backend")?;
        if !flavor.is_empty() {
            candidates.push(format!("llama-server-{flavor}"));
        }
    }
    candidates.push(default_binary_name(recipe).to_string());

    for name in &candidates {
        for dir in ["/usr/local/bin", "/usr/bin"] {
            let path = PathBuf::from(dir).join(name);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    // Last resort: let the OS resolve the bare name via PATH.
    Ok(PathBuf::from(default_binary_name(recipe)))
}

fn default_binary_name(recipe: Recipe) -> &'static str {
    match recipe {
        Recipe::LlamaCpp => "llama-server",
        Recipe::OgaCpu | Recipe::OgaHybrid | Recipe::OgaNpu => "oga-server",
        Recipe::RyzenAi => "ryzenai-server",
        Recipe::Flm => "flm-server",
        Recipe::WhisperCpp => "whisper-server",
    }
}

/// Argument vector for the backend invocation.
fn build_args(
    descriptor: &ModelDescriptor,
    options: &RecipeOptions,
    port: u16,
) -> Result<Vec<String>, ServeError> {
    let model_path = descriptor
        .location
        .local_path()
        .ok_or_else(|| ServeError::LoadFailed {
            model: descriptor.name.clone(),
            reason: "model is not downloaded; pull it first".to_string(),
        })?;

    let mut args: Vec<String> = vec![
        "--model".into(),
        model_path.to_string_lossy().into_owned(),
        "--host".into(),
        "127.0.0.1".into(),
        "--port".into(),
        port.to_string(),
    ];

    match descriptor.recipe {
        Recipe::LlamaCpp => {
            args.push("--ctx-size".into());
            args.push(options.get_int("ctx_size")?.to_string());
            if let Some(mmproj) = &descriptor.mmproj_path {
                args.push("--mmproj".into());
                args.push(mmproj.to_string_lossy().into_owned());
            }
            match descriptor.class {
                ModelClass::Embedding => args.push("--embedding".into()),
                ModelClass::Reranking => args.push("--reranking".into()),
                _ => {}
            }
            args.extend(affinity_args());
            let extra = options.get_text("llamacpp_args")?;
            args.extend(extra.split_whitespace().map(String::from));
        }
        Recipe::OgaCpu | Recipe::OgaHybrid | Recipe::OgaNpu | Recipe::RyzenAi | Recipe::Flm => {
            args.push("--ctx-size".into());
            args.push(options.get_int("ctx_size")?.to_string());
            if let Some(device) = match descriptor.recipe {
                Recipe::OgaCpu => Some("cpu"),
                Recipe::OgaHybrid => Some("hybrid"),
                Recipe::OgaNpu | Recipe::RyzenAi => Some("npu"),
                _ => None,
            } {
                args.push("--device".into());
                args.push(device.into());
            }
        }
        Recipe::WhisperCpp => {
            args.extend(affinity_args());
        }
    }

    Ok(args)
}

/// Thread hints from the topology collaborator, as an opaque argument
/// vector.  One core is left to the server itself.
fn affinity_args() -> Vec<String> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let threads = cores.saturating_sub(1).max(1);
    vec!["--threads".into(), threads.to_string()]
}
