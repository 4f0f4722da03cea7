//! Host-process runtime engine.
//!
//! Every booted instance gets a private root directory. Processes run with the
//! root as working directory, in their own process group and under resource
//! limits. Interactive shells get a pseudo-terminal. The ready signal is
//! raised when a non-interactive process prints a loopback URL, which is how
//! dev servers announce their port.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    ProcessChannel, ProcessEnds, ProcessExit, ProcessHandle, ReadySignal, Resizer, RuntimeEngine,
    RuntimeHandle, SpawnRequest,
};
use crate::config::{LocalEngineConfig, ResourceLimits, TermSize};
use crate::error::EngineError;
use crate::files::{normalize_path, ProjectFileSet};

const READ_CHUNK: usize = 4096;
const MAX_SCAN_LINE: usize = 4096;

/// Engine running project processes directly on the host.
pub struct LocalEngine {
    config: LocalEngineConfig,
}

impl LocalEngine {
    pub fn new(config: LocalEngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RuntimeEngine for LocalEngine {
    async fn boot(&self) -> Result<Arc<dyn RuntimeHandle>, EngineError> {
        let id = uuid::Uuid::new_v4().to_string();
        let root = self.config.base_dir.join(format!("sandbox-{id}"));
        info!(sandbox_root = ?root, "Booting local sandbox");

        let setup_root = root.clone();
        tokio::task::spawn_blocking(move || setup_sandbox_dir(&setup_root))
            .await
            .map_err(|e| EngineError::Unsupported(e.to_string()))??;

        let (ready, _) = broadcast::channel(16);
        Ok(Arc::new(LocalRuntime {
            id,
            root,
            config: self.config.clone(),
            ready,
            children: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
        }))
    }
}

fn setup_sandbox_dir(sandbox_root: &Path) -> Result<(), EngineError> {
    if sandbox_root.exists() {
        cleanup_sandbox(sandbox_root);
    }
    std::fs::create_dir_all(sandbox_root)
        .map_err(|e| EngineError::Unsupported(format!("mkdir {}: {}", sandbox_root.display(), e)))?;

    for dir in ["tmp", "home"] {
        let path = sandbox_root.join(dir);
        std::fs::create_dir_all(&path)
            .map_err(|e| EngineError::Unsupported(format!("mkdir {dir}: {e}")))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(sandbox_root.join("tmp"), std::fs::Permissions::from_mode(0o1777))
            .map_err(|e| EngineError::Unsupported(format!("chmod tmp: {e}")))?;
    }
    Ok(())
}

fn cleanup_sandbox(sandbox_root: &Path) {
    if let Err(e) = std::fs::remove_dir_all(sandbox_root) {
        debug!(sandbox_root = ?sandbox_root, error = %e, "Sandbox cleanup failed");
    }
}

/// One booted host sandbox.
pub struct LocalRuntime {
    id: String,
    root: PathBuf,
    config: LocalEngineConfig,
    ready: broadcast::Sender<ReadySignal>,
    children: Mutex<Vec<ProcessHandle>>,
    torn_down: AtomicBool,
}

impl LocalRuntime {
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, EngineError> {
        let relative = normalize_path(path).map_err(|e| EngineError::Other(e.to_string()))?;
        Ok(self.root.join(relative))
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.torn_down.load(Ordering::Acquire) {
            Err(EngineError::TornDown)
        } else {
            Ok(())
        }
    }

    fn track(&self, handle: ProcessHandle) {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        children.retain(ProcessHandle::is_running);
        children.push(handle);
    }

    fn spawn_terminal(
        &self,
        request: &SpawnRequest,
        size: TermSize,
    ) -> Result<ProcessChannel, EngineError> {
        let command_line = request.command_line();
        let spawn_err = |reason: String| EngineError::Spawn {
            command: command_line.clone(),
            reason,
        };

        let pair = NativePtySystem::default()
            .openpty(pty_size(size))
            .map_err(|e| spawn_err(format!("open pty: {e}")))?;
        let mut cmd = CommandBuilder::new(&request.command);
        cmd.args(&request.args);
        cmd.cwd(&self.root);
        cmd.env("HOME", self.root.join("home"));
        cmd.env("TMPDIR", self.root.join("tmp"));
        cmd.env("TERM", "xterm-256color");
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_err(e.to_string()))?;
        // The reader sees EOF only once every slave handle is closed.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| spawn_err(format!("clone pty reader: {e}")))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| spawn_err(format!("take pty writer: {e}")))?;
        let pid = child.process_id();
        info!(sandbox = %self.id, command = %command_line, pid = ?pid, "Spawned terminal");

        let master: Arc<Mutex<Box<dyn MasterPty + Send>>> = Arc::new(Mutex::new(pair.master));
        let resizer: Resizer = Arc::new(move |size: TermSize| {
            master
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .resize(pty_size(size))
                .is_ok()
        });
        let (channel, ends) = ProcessChannel::pipe(command_line, Some(resizer));
        let ProcessEnds {
            mut input,
            output,
            exit,
            kill,
        } = ends;

        std::thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        std::thread::spawn(move || {
            while let Some(bytes) = input.blocking_recv() {
                if writer.write_all(&bytes).is_err() || writer.flush().is_err() {
                    break;
                }
            }
        });

        let mut killer = child.clone_killer();
        let mut waiter = tokio::task::spawn_blocking(move || child.wait());
        let grace = self.config.kill_grace;
        tokio::spawn(async move {
            let status = tokio::select! {
                status = &mut waiter => match status {
                    Ok(Ok(status)) => ProcessExit::Code(status.exit_code() as i32),
                    Ok(Err(e)) => {
                        warn!(error = %e, "Waiting on terminal failed");
                        ProcessExit::Killed
                    }
                    Err(_) => ProcessExit::Killed,
                },
                _ = kill.cancelled() => terminate_terminal(pid, &mut killer, &mut waiter, grace).await,
            };
            debug!(status = %status, "Terminal exited");
            let _ = exit.send(Some(status));
        });

        self.track(channel.handle().clone());
        Ok(channel)
    }
}

fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[async_trait]
impl RuntimeHandle for LocalRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    async fn mount(&self, files: &ProjectFileSet) -> Result<(), EngineError> {
        self.ensure_live()?;
        for (path, content) in files.iter() {
            self.write_file(path, content).await?;
        }
        info!(sandbox = %self.id, files = files.len(), "Mounted project files");
        Ok(())
    }

    async fn spawn(&self, request: SpawnRequest) -> Result<ProcessChannel, EngineError> {
        self.ensure_live()?;
        if let Some(size) = request.terminal {
            return self.spawn_terminal(&request, size);
        }
        let command_line = request.command_line();

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .current_dir(&self.root)
            .env("HOME", self.root.join("home"))
            .env("TMPDIR", self.root.join("tmp"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(target_os = "linux")]
        apply_resource_limits(&mut cmd, &self.config.limits);

        let mut child = cmd.spawn().map_err(|e| EngineError::Spawn {
            command: command_line.clone(),
            reason: e.to_string(),
        })?;
        info!(sandbox = %self.id, command = %command_line, pid = ?child.id(), "Spawned process");

        let (channel, ends) = ProcessChannel::pipe(command_line, None);
        let ProcessEnds {
            mut input,
            output,
            exit,
            kill,
        } = ends;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(bytes) = input.recv().await {
                    if stdin.write_all(&bytes).await.is_err() || stdin.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        let announce = Some(ReadyAnnouncer {
            ready: self.ready.clone(),
            host: self.config.preview_host.clone(),
        });
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(stdout, output.clone(), announce.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, output, announce));
        }

        let grace = self.config.kill_grace;
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => exit_from_status(status),
                    Err(e) => {
                        warn!(error = %e, "Waiting on child failed");
                        ProcessExit::Killed
                    }
                },
                _ = kill.cancelled() => terminate_child(&mut child, grace).await,
            };
            debug!(status = %status, "Process exited");
            let _ = exit.send(Some(status));
        });

        self.track(channel.handle().clone());
        Ok(channel)
    }

    fn subscribe_ready(&self) -> broadcast::Receiver<ReadySignal> {
        self.ready.subscribe()
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), EngineError> {
        self.ensure_live()?;
        let full_path = self.resolve(path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| EngineError::Fs {
                    op: "mkdir",
                    path: path.to_string(),
                    source,
                })?;
        }
        tokio::fs::write(&full_path, content)
            .await
            .map_err(|source| EngineError::Fs {
                op: "write",
                path: path.to_string(),
                source,
            })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&full_path, std::fs::Permissions::from_mode(0o644))
                .await
                .map_err(|source| EngineError::Fs {
                    op: "chmod",
                    path: path.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), EngineError> {
        self.ensure_live()?;
        let full_path = self.resolve(path)?;
        tokio::fs::create_dir_all(&full_path)
            .await
            .map_err(|source| EngineError::Fs {
                op: "mkdir",
                path: path.to_string(),
                source,
            })
    }

    async fn remove(&self, path: &str) -> Result<(), EngineError> {
        self.ensure_live()?;
        let full_path = self.resolve(path)?;
        let fs_err = |source| EngineError::Fs {
            op: "rm",
            path: path.to_string(),
            source,
        };
        let meta = tokio::fs::metadata(&full_path).await.map_err(fs_err)?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&full_path).await.map_err(fs_err)
        } else {
            tokio::fs::remove_file(&full_path).await.map_err(fs_err)
        }
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let children = std::mem::take(
            &mut *self.children.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for child in children {
            child.terminate().await;
        }
        let root = self.root.clone();
        let _ = tokio::task::spawn_blocking(move || cleanup_sandbox(&root)).await;
        info!(sandbox = %self.id, "Sandbox torn down");
    }
}

#[derive(Clone)]
struct ReadyAnnouncer {
    ready: broadcast::Sender<ReadySignal>,
    host: String,
}

async fn pump_output<R>(mut reader: R, output: mpsc::Sender<Vec<u8>>, announce: Option<ReadyAnnouncer>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    let mut line = String::new();
    let mut announced = false;
    let mut forwarding = true;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = &buf[..n];
        if let (Some(announce), false) = (&announce, announced) {
            line.push_str(&String::from_utf8_lossy(chunk));
            while let Some(pos) = line.find('\n') {
                let complete: String = line.drain(..=pos).collect();
                if let Some(port) = detect_ready_port(&complete) {
                    let url = format!("http://{}:{}", announce.host, port);
                    info!(port, url = %url, "Server ready");
                    let _ = announce.ready.send(ReadySignal { port, url });
                    announced = true;
                    break;
                }
            }
            if line.len() > MAX_SCAN_LINE {
                line.clear();
            }
        }
        // The reader keeps draining after the consumer goes away so the child
        // never blocks on a full pipe.
        if forwarding && output.send(chunk.to_vec()).await.is_err() {
            forwarding = false;
        }
    }
}

/// Port of the first loopback URL in a line of server output.
pub fn detect_ready_port(line: &str) -> Option<u16> {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    static URL: OnceLock<Regex> = OnceLock::new();
    let ansi = ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid regex"));
    let url = URL.get_or_init(|| {
        Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d{2,5})")
            .expect("valid regex")
    });
    let plain = ansi.replace_all(line, "");
    url.captures(&plain)?.get(1)?.as_str().parse().ok()
}

fn exit_from_status(status: std::process::ExitStatus) -> ProcessExit {
    if let Some(code) = status.code() {
        return ProcessExit::Code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return ProcessExit::Signal(sig);
        }
    }
    ProcessExit::Killed
}

async fn terminate_child(child: &mut Child, grace: Duration) -> ProcessExit {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            // SIGTERM the whole group so dev-server children go too.
            let group = Pid::from_raw(pid as i32);
            let _ = killpg(group, Signal::SIGTERM);
            let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
            let _ = killpg(group, Signal::SIGKILL);
            if exited {
                return ProcessExit::Killed;
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = grace;

    let _ = child.start_kill();
    let _ = child.wait().await;
    ProcessExit::Killed
}

/// Hang up a terminal's session, then kill it once the grace period ends.
async fn terminate_terminal(
    pid: Option<u32>,
    killer: &mut Box<dyn ChildKiller + Send + Sync>,
    waiter: &mut JoinHandle<std::io::Result<portable_pty::ExitStatus>>,
    grace: Duration,
) -> ProcessExit {
    #[cfg(target_os = "linux")]
    if let Some(pid) = pid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // The pty child leads its own session and process group.
        let group = Pid::from_raw(pid as i32);
        let _ = killpg(group, Signal::SIGHUP);
        let exited = tokio::time::timeout(grace, &mut *waiter).await.is_ok();
        let _ = killpg(group, Signal::SIGKILL);
        if exited {
            return ProcessExit::Killed;
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = (pid, grace);

    let _ = killer.kill();
    let _ = waiter.await;
    ProcessExit::Killed
}

#[cfg(target_os = "linux")]
fn apply_resource_limits(cmd: &mut Command, limits: &ResourceLimits) {
    let limits = limits.clone();
    // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || set_resource_limits(&limits).map_err(std::io::Error::from));
    }
}

#[cfg(target_os = "linux")]
fn set_resource_limits(limits: &ResourceLimits) -> nix::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    if limits.mem_kb > 0 {
        let bytes = limits.mem_kb * 1024;
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    if limits.fsize_kb > 0 {
        let bytes = limits.fsize_kb * 1024;
        setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
    }
    if limits.nofile > 0 {
        setrlimit(Resource::RLIMIT_NOFILE, limits.nofile, limits.nofile)?;
    }
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
#[allow(dead_code)]
fn apply_resource_limits(_cmd: &mut Command, _limits: &ResourceLimits) {}
