//! Sandbox runtime manager.
//!
//! Owns exactly one runtime instance per client session and drives it
//! through boot, mount, install and serve. The lifecycle state only moves
//! forward; `Failed` and `Disposed` are reachable from anywhere and a failed
//! instance can only be disposed. Recovery is `dispose()` followed by
//! `start()`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{InstallPolicy, PipelineConfig};
use crate::engine::{
    ProcessChannel, ProcessHandle, ProcessId, ReadySignal, RuntimeEngine, RuntimeHandle,
    SpawnRequest,
};
use crate::error::{EngineError, SandboxError};
use crate::files::{normalize_path, parent_dir, ProjectFileSet, SharedFiles};

const EVENT_BUFFER: usize = 256;

/// Lifecycle of a sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Uninitialized,
    Booting,
    Mounted,
    Installing,
    Serving,
    Ready,
    Failed,
    Disposed,
}

impl SandboxState {
    fn rank(self) -> u8 {
        match self {
            SandboxState::Uninitialized => 0,
            SandboxState::Booting => 1,
            SandboxState::Mounted => 2,
            SandboxState::Installing => 3,
            SandboxState::Serving => 4,
            SandboxState::Ready => 5,
            SandboxState::Failed => 6,
            SandboxState::Disposed => 7,
        }
    }

    fn can_move_to(self, next: SandboxState) -> bool {
        match (self, next) {
            (SandboxState::Disposed, _) => false,
            (_, SandboxState::Disposed) => true,
            (SandboxState::Failed, _) => false,
            (_, SandboxState::Failed) => true,
            (current, next) => next.rank() > current.rank(),
        }
    }

    /// Whether terminals can be attached to the instance.
    pub fn is_serving(self) -> bool {
        matches!(self, SandboxState::Serving | SandboxState::Ready)
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SandboxState::Uninitialized => "uninitialized",
            SandboxState::Booting => "booting",
            SandboxState::Mounted => "mounted",
            SandboxState::Installing => "installing",
            SandboxState::Serving => "serving",
            SandboxState::Ready => "ready",
            SandboxState::Failed => "failed",
            SandboxState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Notifications for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxEvent {
    StateChanged(SandboxState),
    /// The install step failed; the pipeline continued.
    InstallFailed { reason: String },
    Failed { error: String },
    PreviewReady { port: u16, url: String },
    /// Install or serve output.
    Output(String),
}

/// Result of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Ok,
    Failed(String),
}

/// What `apply_bulk_change` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkChangeReport {
    pub written: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub reinstalled: bool,
    /// The manifest changed before the instance was ready; install re-runs
    /// once it is.
    pub reinstall_deferred: bool,
}

#[derive(Default)]
struct Instance {
    runtime: Option<Arc<dyn RuntimeHandle>>,
    mounted: bool,
    /// Current serve process. A replacement terminates the previous one.
    serve: Option<ProcessHandle>,
    children: HashMap<ProcessId, ProcessHandle>,
    preview: Option<ReadySignal>,
    failure: Option<SandboxError>,
    /// Manifest content the last install ran against.
    installed_manifest: Option<String>,
    cancel: CancellationToken,
}

struct Shared {
    engine: Arc<dyn RuntimeEngine>,
    config: PipelineConfig,
    files: SharedFiles,
    state: watch::Sender<SandboxState>,
    events: broadcast::Sender<SandboxEvent>,
    instance: Mutex<Instance>,
    /// Serializes bulk changes so reinstalls never overlap.
    bulk: tokio::sync::Mutex<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Instance> {
        self.instance.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: SandboxState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if state.can_move_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            info!(state = %next, "sandbox state changed");
            let _ = self.events.send(SandboxEvent::StateChanged(next));
        }
        moved
    }

    fn advance(&self, next: SandboxState, cancel: &CancellationToken) -> Result<(), SandboxError> {
        if cancel.is_cancelled() || !self.transition(next) {
            return Err(SandboxError::Disposed);
        }
        Ok(())
    }

    fn fail(&self, err: &SandboxError) {
        if !self.state.borrow().can_move_to(SandboxState::Failed) {
            return;
        }
        // Stored first so that state watchers woken by `Failed` find it.
        self.lock().failure = Some(err.clone());
        if self.transition(SandboxState::Failed) {
            let reason = err.to_string();
            error!(error = %reason, "sandbox failed");
            let _ = self.events.send(SandboxEvent::Failed { error: reason });
        }
    }

    /// Whether the file set's manifest differs from the installed one.
    async fn manifest_stale(&self) -> bool {
        let current = self.files.read().await.manifest().to_string();
        self.lock()
            .installed_manifest
            .as_deref()
            .is_some_and(|installed| installed != current)
    }

    fn forward_output(&self, mut output: mpsc::Receiver<Vec<u8>>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(bytes) = output.recv().await {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                debug!(bytes = bytes.len(), "process output");
                let _ = events.send(SandboxEvent::Output(text));
            }
        });
    }

    /// Serve process crashed after becoming ready.
    fn on_serve_exit(&self, id: ProcessId, reason: String) {
        {
            let mut instance = self.lock();
            let current = instance.serve.as_ref().map(ProcessHandle::id);
            if current != Some(id) || instance.cancel.is_cancelled() {
                return;
            }
            instance.serve = None;
            instance.preview = None;
        }
        self.fail(&SandboxError::Serve(reason));
    }
}

/// Per-session sandbox runtime manager. Cheap to clone.
#[derive(Clone)]
pub struct SandboxManager {
    shared: Arc<Shared>,
}

impl SandboxManager {
    pub fn new(engine: Arc<dyn RuntimeEngine>, config: PipelineConfig, files: SharedFiles) -> Self {
        let (state, _) = watch::channel(SandboxState::Uninitialized);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            shared: Arc::new(Shared {
                engine,
                config,
                files,
                state,
                events,
                instance: Mutex::new(Instance::default()),
                bulk: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> SandboxState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SandboxState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SandboxEvent> {
        self.shared.events.subscribe()
    }

    pub fn files(&self) -> &SharedFiles {
        &self.shared.files
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Retained cause of the last failure.
    pub fn failure(&self) -> Option<SandboxError> {
        self.shared.lock().failure.clone()
    }

    /// The preview endpoint. Present only while the instance is `Ready`.
    pub fn preview(&self) -> Option<ReadySignal> {
        let instance = self.shared.lock();
        if self.state() != SandboxState::Ready {
            return None;
        }
        instance.preview.clone()
    }

    pub fn preview_url(&self) -> Option<String> {
        self.preview().map(|p| p.url)
    }

    /// Boot a runtime instance for `initial` and run the pipeline to `Ready`.
    ///
    /// Any stage failure moves the instance to `Failed` and is returned.
    pub async fn start(&self, initial: ProjectFileSet) -> Result<ReadySignal, SandboxError> {
        let cancel = {
            let mut instance = self.shared.lock();
            match self.state() {
                SandboxState::Uninitialized | SandboxState::Disposed => {}
                _ => return Err(SandboxError::AlreadyStarted),
            }
            *instance = Instance::default();
            self.shared.state.send_replace(SandboxState::Uninitialized);
            instance.cancel.clone()
        };
        *self.shared.files.write().await = initial;

        match self.run_pipeline(&cancel).await {
            Ok(ready) => Ok(ready),
            Err(err) => {
                if !cancel.is_cancelled() {
                    self.shared.fail(&err);
                }
                Err(err)
            }
        }
    }

    async fn run_pipeline(&self, cancel: &CancellationToken) -> Result<ReadySignal, SandboxError> {
        let shared = &self.shared;
        shared.advance(SandboxState::Booting, cancel)?;
        let runtime = cancellable(cancel, shared.engine.boot())
            .await?
            .map_err(|err| match err {
                EngineError::Unsupported(reason) => SandboxError::Boot(reason),
                other => SandboxError::Boot(other.to_string()),
            })?;
        info!(runtime = runtime.id(), "runtime booted");
        {
            let mut instance = shared.lock();
            if !cancel.is_cancelled() {
                instance.runtime = Some(Arc::clone(&runtime));
            }
        }
        if cancel.is_cancelled() {
            runtime.teardown().await;
            return Err(SandboxError::Disposed);
        }

        {
            // Bulk changes made while booting are part of the mount.
            let _serial = cancellable(cancel, shared.bulk.lock()).await?;
            let files = shared.files.read().await.clone();
            cancellable(cancel, runtime.mount(&files))
                .await?
                .map_err(|e| SandboxError::Io(e.to_string()))?;
            shared.lock().mounted = true;
            info!(files = files.len(), "project mounted");
        }
        shared.advance(SandboxState::Mounted, cancel)?;

        shared.advance(SandboxState::Installing, cancel)?;
        let outcome = self.install(&runtime, cancel).await?;
        self.apply_install_policy(outcome)?;

        shared.advance(SandboxState::Serving, cancel)?;
        let ready = self.launch_serve(&runtime, cancel).await?;
        shared.lock().preview = Some(ready.clone());
        shared.advance(SandboxState::Ready, cancel)?;
        info!(port = ready.port, url = %ready.url, "preview ready");
        let _ = shared.events.send(SandboxEvent::PreviewReady {
            port: ready.port,
            url: ready.url.clone(),
        });
        self.settle_manifest(&runtime, cancel, ready).await
    }

    /// Reinstall if the manifest changed while install or serve was running.
    async fn settle_manifest(
        &self,
        runtime: &Arc<dyn RuntimeHandle>,
        cancel: &CancellationToken,
        ready: ReadySignal,
    ) -> Result<ReadySignal, SandboxError> {
        let _serial = cancellable(cancel, self.shared.bulk.lock()).await?;
        if self.shared.manifest_stale().await {
            info!("manifest changed during startup");
            return self.reinstall(runtime, cancel).await;
        }
        Ok(self.shared.lock().preview.clone().unwrap_or(ready))
    }

    async fn install(
        &self,
        runtime: &Arc<dyn RuntimeHandle>,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome, SandboxError> {
        let spec = &self.shared.config.install;
        let manifest = self.shared.files.read().await.manifest().to_string();
        self.shared.lock().installed_manifest = Some(manifest);
        info!(command = %spec.display(), "installing dependencies");
        let channel = match runtime.spawn(SpawnRequest::task(spec)).await {
            Ok(channel) => channel,
            Err(EngineError::TornDown) => return Err(SandboxError::Disposed),
            Err(err) => return Ok(StageOutcome::Failed(err.to_string())),
        };
        let (handle, output) = channel.split();
        self.track(handle.clone());
        self.shared.forward_output(output);
        let exit = cancellable(cancel, handle.wait()).await?;
        if exit.success() {
            Ok(StageOutcome::Ok)
        } else {
            Ok(StageOutcome::Failed(format!("{} {exit}", spec.display())))
        }
    }

    fn apply_install_policy(&self, outcome: StageOutcome) -> Result<(), SandboxError> {
        let StageOutcome::Failed(reason) = outcome else {
            return Ok(());
        };
        match self.shared.config.install_policy {
            InstallPolicy::Continue => {
                warn!(%reason, "install failed, starting the preview server anyway");
                let _ = self
                    .shared
                    .events
                    .send(SandboxEvent::InstallFailed { reason });
                Ok(())
            }
            InstallPolicy::Halt => Err(SandboxError::Install(reason)),
        }
    }

    /// Spawn the serve command and wait for its ready signal.
    async fn launch_serve(
        &self,
        runtime: &Arc<dyn RuntimeHandle>,
        cancel: &CancellationToken,
    ) -> Result<ReadySignal, SandboxError> {
        let spec = &self.shared.config.serve;
        let mut ready = runtime.subscribe_ready();
        let channel = runtime
            .spawn(SpawnRequest::task(spec))
            .await
            .map_err(|e| match e {
                EngineError::TornDown => SandboxError::Disposed,
                other => SandboxError::Serve(other.to_string()),
            })?;
        let (handle, output) = channel.split();
        info!(command = %spec.display(), process = %handle.id(), "preview server spawned");
        self.shared.lock().serve = Some(handle.clone());
        self.shared.forward_output(output);

        let timeout = self.shared.config.ready_timeout;
        let wait = async {
            loop {
                tokio::select! {
                    biased;
                    signal = ready.recv() => match signal {
                        Ok(signal) => return Ok(signal),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(SandboxError::Serve("runtime closed".to_string()))
                        }
                    },
                    exit = handle.wait() => {
                        return Err(SandboxError::Serve(format!(
                            "{} {exit} before becoming ready",
                            spec.display()
                        )))
                    }
                }
            }
        };
        let signal = cancellable(cancel, tokio::time::timeout(timeout, wait))
            .await?
            .unwrap_or_else(|_| Err(SandboxError::ReadyTimeout(timeout)))?;

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let exit = handle.wait().await;
            shared.on_serve_exit(handle.id(), format!("preview server {exit}"));
        });
        Ok(signal)
    }

    fn live(&self) -> Option<(Arc<dyn RuntimeHandle>, CancellationToken)> {
        let instance = self.shared.lock();
        if !instance.mounted || instance.cancel.is_cancelled() {
            return None;
        }
        let runtime = instance.runtime.clone()?;
        Some((runtime, instance.cancel.clone()))
    }

    fn track(&self, handle: ProcessHandle) {
        self.shared
            .lock()
            .children
            .insert(handle.id(), handle.clone());
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            handle.wait().await;
            shared.lock().children.remove(&handle.id());
        });
    }

    async fn write_through(
        runtime: &Arc<dyn RuntimeHandle>,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        if let Some(dir) = parent_dir(path) {
            runtime.mkdir(dir).await?;
        }
        runtime.write_file(path, content).await?;
        Ok(())
    }

    /// Write one file into the mounted runtime.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let path = normalize_path(path)?;
        let (runtime, _) = self
            .live()
            .ok_or_else(|| SandboxError::Io(format!("{path}: runtime is not mounted")))?;
        Self::write_through(&runtime, &path, content).await?;
        debug!(%path, "file written to runtime");
        Ok(())
    }

    /// Create a new file in both the file set and the runtime.
    pub async fn create_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let path = normalize_path(path)?;
        let mut files = self.shared.files.write().await;
        if files.contains(&path) {
            return Err(SandboxError::FileExists(path));
        }
        let (runtime, _) = self
            .live()
            .ok_or_else(|| SandboxError::Io(format!("{path}: runtime is not mounted")))?;
        Self::write_through(&runtime, &path, content).await?;
        files.insert(&path, content)?;
        info!(%path, "file created");
        Ok(())
    }

    /// Delete a file, or a directory and everything under it.
    pub async fn delete_file(&self, path: &str) -> Result<(), SandboxError> {
        let path = normalize_path(path)?;
        let mut files = self.shared.files.write().await;
        let nested = format!("{path}/");
        let doomed: Vec<String> = files
            .paths()
            .filter(|p| *p == path || p.starts_with(&nested))
            .map(str::to_string)
            .collect();
        if doomed.is_empty() {
            return Err(SandboxError::FileNotFound(path));
        }
        let (runtime, _) = self
            .live()
            .ok_or_else(|| SandboxError::Io(format!("{path}: runtime is not mounted")))?;
        runtime.remove(&path).await?;
        for p in &doomed {
            files.remove(p);
        }
        info!(%path, removed = doomed.len(), "file deleted");
        Ok(())
    }

    /// Merge `changes` into the file set and write each entry through.
    ///
    /// A root manifest that no longer matches the installed one re-runs
    /// install and replaces the serve process. Before `Ready` the reinstall
    /// is deferred until the pipeline gets there.
    pub async fn apply_bulk_change(
        &self,
        changes: ProjectFileSet,
    ) -> Result<BulkChangeReport, SandboxError> {
        let _serial = self.shared.bulk.lock().await;
        self.shared.files.write().await.merge(&changes);

        let mut report = BulkChangeReport::default();
        let live = self.live();
        match &live {
            Some((runtime, _)) => {
                for (path, content) in changes.iter() {
                    match Self::write_through(runtime, path, content).await {
                        Ok(()) => report.written.push(path.to_string()),
                        Err(err) => {
                            warn!(%path, error = %err, "bulk write failed");
                            report.failed.push((path.to_string(), err.to_string()));
                        }
                    }
                }
            }
            None => debug!(files = changes.len(), "no mounted runtime, file set updated only"),
        }
        let stale = self.shared.manifest_stale().await;
        info!(
            written = report.written.len(),
            failed = report.failed.len(),
            manifest_changed = stale,
            "bulk change applied"
        );
        if !stale {
            return Ok(report);
        }

        match (self.state(), live) {
            (SandboxState::Ready, Some((runtime, cancel))) => {
                if let Err(err) = self.reinstall(&runtime, &cancel).await {
                    if !cancel.is_cancelled() {
                        self.shared.fail(&err);
                    }
                    return Err(err);
                }
                report.reinstalled = true;
            }
            (SandboxState::Installing | SandboxState::Serving, _) => {
                info!("instance not ready yet, reinstall deferred");
                report.reinstall_deferred = true;
            }
            _ => {}
        }
        Ok(report)
    }

    async fn reinstall(
        &self,
        runtime: &Arc<dyn RuntimeHandle>,
        cancel: &CancellationToken,
    ) -> Result<ReadySignal, SandboxError> {
        info!("dependency manifest changed, reinstalling");
        let outcome = self.install(runtime, cancel).await?;
        self.apply_install_policy(outcome)?;

        let previous = self.shared.lock().serve.take();
        if let Some(previous) = previous {
            let exit = cancellable(cancel, previous.terminate()).await?;
            info!(process = %previous.id(), %exit, "previous preview server stopped");
        }
        let ready = self.launch_serve(runtime, cancel).await?;
        self.shared.lock().preview = Some(ready.clone());
        info!(port = ready.port, url = %ready.url, "preview ready after reinstall");
        let _ = self.shared.events.send(SandboxEvent::PreviewReady {
            port: ready.port,
            url: ready.url.clone(),
        });
        Ok(ready)
    }

    /// Spawn a process in the mounted runtime. Used for interactive shells.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<ProcessChannel, SandboxError> {
        let (runtime, _) = self.live().ok_or(SandboxError::RuntimeUnavailable)?;
        let channel = runtime.spawn(request).await?;
        self.track(channel.handle().clone());
        Ok(channel)
    }

    /// Terminate every owned process and release the instance. Idempotent.
    pub async fn dispose(&self) {
        let (runtime, processes) = {
            let mut instance = self.shared.lock();
            if self.state() == SandboxState::Disposed {
                return;
            }
            instance.cancel.cancel();
            instance.mounted = false;
            instance.preview = None;
            let mut processes: Vec<ProcessHandle> =
                instance.children.drain().map(|(_, h)| h).collect();
            processes.extend(instance.serve.take());
            (instance.runtime.take(), processes)
        };
        for process in &processes {
            process.terminate().await;
        }
        if let Some(runtime) = runtime {
            runtime.teardown().await;
        }
        self.shared.transition(SandboxState::Disposed);
        info!(processes = processes.len(), "sandbox disposed");
    }
}

async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, SandboxError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SandboxError::Disposed),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{MemoryEngine, Script};
    use crate::engine::ProcessExit;
    use std::time::Duration;

    fn engine() -> MemoryEngine {
        MemoryEngine::with_preview_host("host")
            .script("npm install", Script::exits(0))
            .script("npm run dev", Script::serves(4000))
    }

    fn manager(engine: &MemoryEngine, config: PipelineConfig) -> SandboxManager {
        SandboxManager::new(Arc::new(engine.clone()), config, SharedFiles::default())
    }

    fn project() -> ProjectFileSet {
        ProjectFileSet::from_entries([
            ("package.json", "{\"name\":\"demo\"}"),
            ("src/main.jsx", "render()"),
        ])
        .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<SandboxEvent>) -> Vec<SandboxEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn pipeline_reaches_ready_in_order() {
        let engine = engine();
        let sandbox = manager(&engine, PipelineConfig::default());
        let mut events = sandbox.subscribe_events();
        assert_eq!(sandbox.preview_url(), None);

        let ready = sandbox.start(project()).await.unwrap();
        assert_eq!(ready.port, 4000);
        assert_eq!(ready.url, "http://host:4000");
        assert_eq!(sandbox.preview_url().as_deref(), Some("http://host:4000"));

        let states: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SandboxEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            [
                SandboxState::Booting,
                SandboxState::Mounted,
                SandboxState::Installing,
                SandboxState::Serving,
                SandboxState::Ready,
            ]
        );
        let runtime = engine.last_runtime().unwrap();
        assert_eq!(runtime.file("src/main.jsx").as_deref(), Some("render()"));
        assert_eq!(runtime.mount_count(), 1);
        assert_eq!(runtime.spawn_count("npm install"), 1);
        assert_eq!(runtime.running("npm run dev"), 1);
    }

    #[tokio::test]
    async fn boot_failure_is_fatal() {
        let engine = engine().fail_boot("no cross-origin isolation");
        let sandbox = manager(&engine, PipelineConfig::default());
        let err = sandbox.start(project()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Boot(_)));
        assert!(err.is_fatal());
        assert_eq!(sandbox.state(), SandboxState::Failed);
        assert!(matches!(sandbox.failure(), Some(SandboxError::Boot(r)) if r.contains("cross-origin")));
    }

    #[tokio::test]
    async fn install_failure_continues_by_default() {
        let engine = engine().script("npm install", Script::exits(1));
        let sandbox = manager(&engine, PipelineConfig::default());
        let mut events = sandbox.subscribe_events();
        sandbox.start(project()).await.unwrap();
        assert_eq!(sandbox.state(), SandboxState::Ready);
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, SandboxEvent::InstallFailed { .. })));
    }

    #[tokio::test]
    async fn install_failure_halts_when_asked() {
        let engine = engine().script("npm install", Script::exits(1));
        let config = PipelineConfig {
            install_policy: InstallPolicy::Halt,
            ..PipelineConfig::default()
        };
        let sandbox = manager(&engine, config);
        let err = sandbox.start(project()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Install(_)));
        assert_eq!(sandbox.state(), SandboxState::Failed);
        assert_eq!(engine.last_runtime().unwrap().spawn_count("npm run dev"), 0);
    }

    #[tokio::test]
    async fn missing_ready_signal_times_out() {
        let engine = engine().script("npm run dev", Script::hangs());
        let config = PipelineConfig {
            ready_timeout: Duration::from_millis(50),
            ..PipelineConfig::default()
        };
        let sandbox = manager(&engine, config);
        let err = sandbox.start(project()).await.unwrap_err();
        assert!(matches!(err, SandboxError::ReadyTimeout(_)));
        assert_eq!(sandbox.state(), SandboxState::Failed);
        assert_eq!(sandbox.preview_url(), None);
    }

    #[tokio::test]
    async fn serve_exiting_early_is_a_serve_error() {
        let engine = engine().script("npm run dev", Script::exits(1).with_output("boom"));
        let sandbox = manager(&engine, PipelineConfig::default());
        let err = sandbox.start(project()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Serve(_)));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let engine = engine();
        let sandbox = manager(&engine, PipelineConfig::default());
        sandbox.start(project()).await.unwrap();
        assert!(matches!(
            sandbox.start(project()).await,
            Err(SandboxError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn manifest_change_replaces_the_serve_process() {
        let engine = engine();
        let sandbox = manager(&engine, PipelineConfig::default());
        sandbox.start(project()).await.unwrap();
        let runtime = engine.last_runtime().unwrap();
        let first_serve = runtime
            .spawned()
            .into_iter()
            .find(|r| r.command_line == "npm run dev")
            .unwrap();

        let changes = ProjectFileSet::from_entries([
            ("package.json", "{\"name\":\"demo\",\"dependencies\":{\"react\":\"18\"}}"),
            ("src/App.jsx", "app"),
        ])
        .unwrap();
        let report = sandbox.apply_bulk_change(changes).await.unwrap();

        assert!(report.reinstalled);
        assert_eq!(report.written.len(), 2);
        assert_eq!(runtime.spawn_count("npm install"), 2);
        assert_eq!(runtime.spawn_count("npm run dev"), 2);
        assert_eq!(runtime.running("npm run dev"), 1);
        assert_eq!(first_serve.handle.exit_status(), Some(ProcessExit::Killed));
        assert_eq!(sandbox.state(), SandboxState::Ready);
        assert_eq!(runtime.file("src/App.jsx").as_deref(), Some("app"));
    }

    #[tokio::test]
    async fn manifest_change_while_serving_reinstalls_once_ready() {
        let engine = engine().script("npm run dev", Script::hangs());
        let sandbox = manager(&engine, PipelineConfig::default());
        let mut state = sandbox.subscribe_state();
        let pending = tokio::spawn({
            let sandbox = sandbox.clone();
            async move { sandbox.start(project()).await }
        });
        state
            .wait_for(|s| *s == SandboxState::Serving)
            .await
            .unwrap();

        let manifest = ProjectFileSet::from_entries([(
            "package.json",
            "{\"name\":\"demo\",\"dependencies\":{\"react\":\"18\"}}",
        )])
        .unwrap();
        let report = sandbox.apply_bulk_change(manifest.clone()).await.unwrap();
        assert!(!report.reinstalled);
        assert!(report.reinstall_deferred);
        let repeated = sandbox.apply_bulk_change(manifest.clone()).await.unwrap();
        assert!(repeated.reinstall_deferred);

        let runtime = engine.last_runtime().unwrap();
        assert_eq!(runtime.spawn_count("npm run dev"), 1);
        engine.set_script("npm run dev", Script::serves(4001));
        runtime.signal_ready(4000);

        let ready = pending.await.unwrap().unwrap();
        assert_eq!(ready.port, 4001);
        assert_eq!(sandbox.state(), SandboxState::Ready);
        assert_eq!(sandbox.preview_url().as_deref(), Some("http://host:4001"));
        assert_eq!(runtime.spawn_count("npm install"), 2);
        assert_eq!(runtime.spawn_count("npm run dev"), 2);
        assert_eq!(runtime.running("npm run dev"), 1);

        let settled = sandbox.apply_bulk_change(manifest).await.unwrap();
        assert!(!settled.reinstalled);
        assert!(!settled.reinstall_deferred);
        assert_eq!(runtime.spawn_count("npm install"), 2);
    }

    #[tokio::test]
    async fn unchanged_manifest_does_not_reinstall() {
        let engine = engine();
        let sandbox = manager(&engine, PipelineConfig::default());
        sandbox.start(project()).await.unwrap();
        let changes = ProjectFileSet::from_entries([
            ("package.json", "{\"name\":\"demo\"}"),
            ("README.md", "hi"),
        ])
        .unwrap();
        let report = sandbox.apply_bulk_change(changes).await.unwrap();
        assert!(!report.reinstalled);
        let runtime = engine.last_runtime().unwrap();
        assert_eq!(runtime.spawn_count("npm install"), 1);
        assert_eq!(runtime.spawn_count("npm run dev"), 1);
    }

    #[tokio::test]
    async fn write_file_requires_a_mounted_runtime() {
        let engine = engine();
        let sandbox = manager(&engine, PipelineConfig::default());
        assert!(matches!(
            sandbox.write_file("a.js", "x").await,
            Err(SandboxError::Io(_))
        ));
        sandbox.start(project()).await.unwrap();
        sandbox.write_file("/src/deep/a.js", "x").await.unwrap();
        let runtime = engine.last_runtime().unwrap();
        assert_eq!(runtime.file("src/deep/a.js").as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn create_and_delete_keep_file_set_and_runtime_together() {
        let engine = engine();
        let sandbox = manager(&engine, PipelineConfig::default());
        sandbox.start(project()).await.unwrap();
        let runtime = engine.last_runtime().unwrap();

        sandbox.create_file("src/components/Nav.jsx", "nav").await.unwrap();
        assert!(matches!(
            sandbox.create_file("src/components/Nav.jsx", "again").await,
            Err(SandboxError::FileExists(_))
        ));
        assert_eq!(
            sandbox.files().read().await.get("src/components/Nav.jsx"),
            Some("nav")
        );
        assert!(runtime.has_dir("src/components"));

        sandbox.delete_file("src/components").await.unwrap();
        assert!(!sandbox.files().read().await.contains("src/components/Nav.jsx"));
        assert!(runtime.file("src/components/Nav.jsx").is_none());
        assert!(matches!(
            sandbox.delete_file("nope.js").await,
            Err(SandboxError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_runtime_writes_are_reported_per_file() {
        let engine = engine();
        let sandbox = manager(&engine, PipelineConfig::default());
        sandbox.start(project()).await.unwrap();
        let runtime = engine.last_runtime().unwrap();
        runtime.set_fail_writes(true);

        let changes =
            ProjectFileSet::from_entries([("src/a.js", "a"), ("src/b.js", "b")]).unwrap();
        let report = sandbox.apply_bulk_change(changes).await.unwrap();
        assert!(report.written.is_empty());
        let failed: Vec<_> = report.failed.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(failed, ["src/a.js", "src/b.js"]);
        assert!(report.failed[0].1.contains("injected failure"));
        assert!(!report.reinstalled);
        // The file set still holds the change; only the runtime missed it.
        assert_eq!(sandbox.files().read().await.get("src/a.js"), Some("a"));
        assert_eq!(runtime.file("src/a.js"), None);

        runtime.set_fail_writes(false);
        let report = sandbox
            .apply_bulk_change(ProjectFileSet::from_entries([("src/a.js", "a2")]).unwrap())
            .await
            .unwrap();
        assert_eq!(report.written, ["src/a.js"]);
        assert_eq!(runtime.file("src/a.js").as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn failed_create_leaves_no_partial_file() {
        let engine = engine();
        let sandbox = manager(&engine, PipelineConfig::default());
        sandbox.start(project()).await.unwrap();
        let runtime = engine.last_runtime().unwrap();
        runtime.set_fail_writes(true);

        assert!(matches!(
            sandbox.create_file("src/new.js", "n").await,
            Err(SandboxError::Io(_))
        ));
        assert!(!sandbox.files().read().await.contains("src/new.js"));
        assert_eq!(runtime.file("src/new.js"), None);
        assert!(matches!(
            sandbox.write_file("src/main.jsx", "x").await,
            Err(SandboxError::Io(_))
        ));
        assert!(matches!(
            sandbox.delete_file("src/main.jsx").await,
            Err(SandboxError::Io(_))
        ));
        assert!(sandbox.files().read().await.contains("src/main.jsx"));

        runtime.set_fail_writes(false);
        sandbox.create_file("src/new.js", "n").await.unwrap();
        assert_eq!(runtime.file("src/new.js").as_deref(), Some("n"));
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_kills_everything() {
        let engine = engine();
        let sandbox = manager(&engine, PipelineConfig::default());
        sandbox.start(project()).await.unwrap();
        let runtime = engine.last_runtime().unwrap();

        sandbox.dispose().await;
        sandbox.dispose().await;
        assert_eq!(sandbox.state(), SandboxState::Disposed);
        assert_eq!(runtime.running("npm run dev"), 0);
        assert!(runtime.is_torn_down());
        assert_eq!(sandbox.preview_url(), None);
        assert!(sandbox.write_file("a.js", "x").await.is_err());
    }

    #[tokio::test]
    async fn dispose_cancels_a_pending_start() {
        let engine = engine().script("npm run dev", Script::hangs());
        let sandbox = manager(&engine, PipelineConfig::default());
        let mut state = sandbox.subscribe_state();
        let pending = tokio::spawn({
            let sandbox = sandbox.clone();
            async move { sandbox.start(project()).await }
        });
        state
            .wait_for(|s| *s == SandboxState::Serving)
            .await
            .unwrap();
        sandbox.dispose().await;
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(SandboxError::Disposed)));
        assert_eq!(sandbox.state(), SandboxState::Disposed);
    }

    #[tokio::test]
    async fn restart_after_dispose_boots_a_new_instance() {
        let engine = engine();
        let sandbox = manager(&engine, PipelineConfig::default());
        sandbox.start(project()).await.unwrap();
        sandbox.dispose().await;
        sandbox.start(project()).await.unwrap();
        assert_eq!(engine.runtimes().len(), 2);
        assert_eq!(sandbox.state(), SandboxState::Ready);
    }

    #[tokio::test]
    async fn serve_crash_after_ready_fails_the_instance() {
        let engine = engine();
        let sandbox = manager(&engine, PipelineConfig::default());
        sandbox.start(project()).await.unwrap();
        let runtime = engine.last_runtime().unwrap();
        let serve = runtime
            .spawned()
            .into_iter()
            .find(|r| r.command_line == "npm run dev")
            .unwrap();
        let mut state = sandbox.subscribe_state();
        serve.handle.kill();
        state
            .wait_for(|s| *s == SandboxState::Failed)
            .await
            .unwrap();
        assert_eq!(sandbox.preview_url(), None);
    }
}
