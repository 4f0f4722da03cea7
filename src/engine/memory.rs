//! Scripted in-memory runtime engine.
//!
//! Commands are matched against registered [`Script`]s by command-line
//! prefix; unknown commands exit 0 immediately. Interactive shells echo their
//! input. Everything spawned is recorded so callers can assert on process
//! lifecycles without a real sandbox.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{
    ProcessChannel, ProcessEnds, ProcessExit, ProcessHandle, ReadySignal, Resizer,
    RuntimeEngine, RuntimeHandle, SpawnRequest,
};
use crate::config::TermSize;
use crate::error::EngineError;
use crate::files::{parent_dir, ProjectFileSet};

/// Behaviour of a scripted command.
#[derive(Debug, Clone, Default)]
pub struct Script {
    output: Vec<String>,
    exit: Option<i32>,
    ready_port: Option<u16>,
}

impl Script {
    /// Print the output lines, then exit with `code`.
    pub fn exits(code: i32) -> Self {
        Self {
            exit: Some(code),
            ..Self::default()
        }
    }

    /// Raise a ready signal for `port`, then run until killed.
    pub fn serves(port: u16) -> Self {
        Self {
            ready_port: Some(port),
            ..Self::default()
        }
    }

    /// Run until killed without ever becoming ready.
    pub fn hangs() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, line: impl Into<String>) -> Self {
        self.output.push(line.into());
        self
    }
}

struct Shared {
    preview_host: String,
    boot_error: Mutex<Option<String>>,
    scripts: Mutex<Vec<(String, Script)>>,
    runtimes: Mutex<Vec<Arc<MemoryRuntime>>>,
}

impl Shared {
    fn script_for(&self, command_line: &str) -> Script {
        let scripts = match self.scripts.lock() {
            Ok(scripts) => scripts,
            Err(_) => return Script::exits(0),
        };
        scripts
            .iter()
            .filter(|(prefix, _)| {
                command_line == prefix || command_line.starts_with(&format!("{prefix} "))
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, script)| script.clone())
            .unwrap_or_else(|| Script::exits(0))
    }
}

/// Engine whose instances live entirely in memory.
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_preview_host("localhost")
    }

    pub fn with_preview_host(host: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                preview_host: host.into(),
                boot_error: Mutex::new(None),
                scripts: Mutex::new(Vec::new()),
                runtimes: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register the behaviour of commands starting with `prefix`.
    pub fn script(self, prefix: impl Into<String>, script: Script) -> Self {
        self.set_script(prefix, script);
        self
    }

    /// Replace or add a script on an engine that is already in use.
    pub fn set_script(&self, prefix: impl Into<String>, script: Script) {
        let prefix = prefix.into();
        if let Ok(mut scripts) = self.shared.scripts.lock() {
            scripts.retain(|(p, _)| *p != prefix);
            scripts.push((prefix, script));
        }
    }

    /// Make every subsequent boot fail as if the host had no sandboxing.
    pub fn fail_boot(self, reason: impl Into<String>) -> Self {
        if let Ok(mut err) = self.shared.boot_error.lock() {
            *err = Some(reason.into());
        }
        self
    }

    pub fn runtimes(&self) -> Vec<Arc<MemoryRuntime>> {
        self.shared
            .runtimes
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn last_runtime(&self) -> Option<Arc<MemoryRuntime>> {
        self.runtimes().pop()
    }
}

#[async_trait]
impl RuntimeEngine for MemoryEngine {
    async fn boot(&self) -> Result<Arc<dyn RuntimeHandle>, EngineError> {
        if let Ok(err) = self.shared.boot_error.lock() {
            if let Some(reason) = err.as_ref() {
                return Err(EngineError::Unsupported(reason.clone()));
            }
        }
        let (ready, _) = broadcast::channel(16);
        let runtime = Arc::new(MemoryRuntime {
            id: uuid::Uuid::new_v4().to_string(),
            shared: Arc::clone(&self.shared),
            files: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(BTreeSet::new()),
            spawned: Mutex::new(Vec::new()),
            ready,
            fail_writes: AtomicBool::new(false),
            mounts: AtomicUsize::new(0),
            torn_down: AtomicBool::new(false),
        });
        if let Ok(mut runtimes) = self.shared.runtimes.lock() {
            runtimes.push(Arc::clone(&runtime));
        }
        Ok(runtime)
    }
}

/// A process spawned in a [`MemoryRuntime`].
#[derive(Debug, Clone)]
pub struct SpawnRecord {
    pub command_line: String,
    pub terminal: Option<TermSize>,
    pub handle: ProcessHandle,
    resizes: Arc<Mutex<Vec<TermSize>>>,
}

impl SpawnRecord {
    pub fn resizes(&self) -> Vec<TermSize> {
        self.resizes.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

/// In-memory runtime instance.
pub struct MemoryRuntime {
    id: String,
    shared: Arc<Shared>,
    files: Mutex<BTreeMap<String, String>>,
    dirs: Mutex<BTreeSet<String>>,
    spawned: Mutex<Vec<SpawnRecord>>,
    ready: broadcast::Sender<ReadySignal>,
    fail_writes: AtomicBool,
    mounts: AtomicUsize,
    torn_down: AtomicBool,
}

impl MemoryRuntime {
    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().ok()?.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.dirs.lock().map(|d| d.contains(path)).unwrap_or(false)
    }

    pub fn spawned(&self) -> Vec<SpawnRecord> {
        self.spawned.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of processes ever spawned with exactly this command line.
    pub fn spawn_count(&self, command_line: &str) -> usize {
        self.spawned()
            .iter()
            .filter(|r| r.command_line == command_line)
            .count()
    }

    /// Number of processes with this command line that have not exited.
    pub fn running(&self, command_line: &str) -> usize {
        self.spawned()
            .iter()
            .filter(|r| r.command_line == command_line && r.handle.is_running())
            .count()
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::Acquire)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Raise a ready signal as if a serve process had started listening.
    pub fn signal_ready(&self, port: u16) {
        let _ = self.ready.send(ReadySignal {
            port,
            url: format!("http://{}:{port}", self.shared.preview_host),
        });
    }

    /// Make filesystem mutations fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    fn check_writable(&self, op: &'static str, path: &str) -> Result<(), EngineError> {
        if self.is_torn_down() {
            return Err(EngineError::TornDown);
        }
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(EngineError::Fs {
                op,
                path: path.to_string(),
                source: io::Error::new(io::ErrorKind::Other, "injected failure"),
            });
        }
        Ok(())
    }

    fn add_dirs(&self, path: &str) {
        if let Ok(mut dirs) = self.dirs.lock() {
            let mut prefix = String::new();
            for part in path.split('/') {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(part);
                dirs.insert(prefix.clone());
            }
        }
    }
}

#[async_trait]
impl RuntimeHandle for MemoryRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    async fn mount(&self, files: &ProjectFileSet) -> Result<(), EngineError> {
        self.check_writable("mount", "/")?;
        for (path, _) in files.iter() {
            if let Some(dir) = parent_dir(path) {
                self.add_dirs(dir);
            }
        }
        if let Ok(mut stored) = self.files.lock() {
            stored.clear();
            stored.extend(files.iter().map(|(p, c)| (p.to_string(), c.to_string())));
        }
        self.mounts.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn spawn(&self, request: SpawnRequest) -> Result<ProcessChannel, EngineError> {
        if self.is_torn_down() {
            return Err(EngineError::TornDown);
        }
        let command_line = request.command_line();
        let resizes = Arc::new(Mutex::new(Vec::new()));

        let (channel, ends) = if request.terminal.is_some() {
            let log = Arc::clone(&resizes);
            let resizer: Resizer = Arc::new(move |size: TermSize| {
                if let Ok(mut log) = log.lock() {
                    log.push(size);
                }
                true
            });
            let (channel, ends) = ProcessChannel::pipe(command_line.clone(), Some(resizer));
            tokio::spawn(run_echo_shell(ends));
            (channel, None)
        } else {
            let (channel, ends) = ProcessChannel::pipe(command_line.clone(), None);
            (channel, Some(ends))
        };

        if let Some(ends) = ends {
            let script = self.shared.script_for(&command_line);
            let ready = self.ready.clone();
            let host = self.shared.preview_host.clone();
            tokio::spawn(run_script(script, ends, ready, host));
        }

        if let Ok(mut spawned) = self.spawned.lock() {
            spawned.push(SpawnRecord {
                command_line,
                terminal: request.terminal,
                handle: channel.handle().clone(),
                resizes,
            });
        }
        Ok(channel)
    }

    fn subscribe_ready(&self) -> broadcast::Receiver<ReadySignal> {
        self.ready.subscribe()
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), EngineError> {
        self.check_writable("write", path)?;
        if let Some(dir) = parent_dir(path) {
            if !self.has_dir(dir) {
                return Err(EngineError::Fs {
                    op: "write",
                    path: path.to_string(),
                    source: io::Error::new(io::ErrorKind::NotFound, "parent directory missing"),
                });
            }
        }
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.to_string(), content.to_string());
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), EngineError> {
        self.check_writable("mkdir", path)?;
        self.add_dirs(path);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), EngineError> {
        self.check_writable("rm", path)?;
        let removed_file = self
            .files
            .lock()
            .map(|mut f| f.remove(path).is_some())
            .unwrap_or(false);
        if removed_file {
            return Ok(());
        }
        if self.has_dir(path) {
            let nested = format!("{path}/");
            if let Ok(mut files) = self.files.lock() {
                files.retain(|p, _| !p.starts_with(&nested));
            }
            if let Ok(mut dirs) = self.dirs.lock() {
                dirs.retain(|d| d != path && !d.starts_with(&nested));
            }
            return Ok(());
        }
        Err(EngineError::Fs {
            op: "rm",
            path: path.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file or directory"),
        })
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for record in self.spawned() {
            record.handle.terminate().await;
        }
    }
}

async fn run_echo_shell(ends: ProcessEnds) {
    let ProcessEnds {
        mut input,
        output,
        exit,
        kill,
    } = ends;
    let status = loop {
        tokio::select! {
            _ = kill.cancelled() => break ProcessExit::Killed,
            bytes = input.recv() => match bytes {
                Some(bytes) => {
                    let _ = output.send(bytes).await;
                }
                None => break ProcessExit::Code(0),
            },
        }
    };
    let _ = exit.send(Some(status));
}

async fn run_script(
    script: Script,
    ends: ProcessEnds,
    ready: broadcast::Sender<ReadySignal>,
    host: String,
) {
    let ProcessEnds {
        output, exit, kill, ..
    } = ends;
    for line in &script.output {
        let _ = output.send(format!("{line}\n").into_bytes()).await;
    }
    if let Some(port) = script.ready_port {
        let _ = ready.send(ReadySignal {
            port,
            url: format!("http://{host}:{port}"),
        });
    }
    let status = match script.exit {
        Some(code) if !kill.is_cancelled() => ProcessExit::Code(code),
        _ => {
            kill.cancelled().await;
            ProcessExit::Killed
        }
    };
    let _ = exit.send(Some(status));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandSpec;

    #[tokio::test]
    async fn scripts_match_longest_prefix() {
        let engine = MemoryEngine::new()
            .script("npm", Script::exits(0))
            .script("npm install", Script::exits(1));
        let runtime = engine.boot().await.unwrap();
        let install = runtime
            .spawn(SpawnRequest::task(&CommandSpec::new("npm", ["install"])))
            .await
            .unwrap();
        let test = runtime
            .spawn(SpawnRequest::task(&CommandSpec::new("npm", ["test"])))
            .await
            .unwrap();
        assert_eq!(install.handle().wait().await, ProcessExit::Code(1));
        assert_eq!(test.handle().wait().await, ProcessExit::Code(0));
    }

    #[tokio::test]
    async fn write_requires_parent_directory() {
        let engine = MemoryEngine::new();
        let runtime = engine.boot().await.unwrap();
        assert!(runtime.write_file("src/a.js", "x").await.is_err());
        runtime.mkdir("src").await.unwrap();
        runtime.write_file("src/a.js", "x").await.unwrap();
        let memory = engine.last_runtime().unwrap();
        assert_eq!(memory.file("src/a.js").as_deref(), Some("x"));
        runtime.remove("src").await.unwrap();
        assert!(memory.file("src/a.js").is_none());
    }

    #[tokio::test]
    async fn teardown_kills_servers() {
        let engine = MemoryEngine::new().script("npm run dev", Script::serves(4000));
        let runtime = engine.boot().await.unwrap();
        let mut ready = runtime.subscribe_ready();
        let serve = runtime
            .spawn(SpawnRequest::task(&CommandSpec::new("npm", ["run", "dev"])))
            .await
            .unwrap();
        assert_eq!(ready.recv().await.unwrap().port, 4000);
        runtime.teardown().await;
        assert_eq!(serve.handle().exit_status(), Some(ProcessExit::Killed));
        assert!(engine.last_runtime().unwrap().is_torn_down());
    }
}
