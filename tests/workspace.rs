use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use devroom::codegen::GenerateResponse;
use devroom::config::{InstallPolicy, WorkspaceConfig};
use devroom::engine::memory::{MemoryEngine, Script};
use devroom::files::ProjectFileSet;
use devroom::presence::RoomRegistry;
use devroom::store::{MemoryStore, ProjectStore};
use devroom::{SandboxError, SandboxState, Workspace};
use tokio::time::{sleep, timeout};

const PROJECT: &str = "proj1";

fn engine() -> MemoryEngine {
    MemoryEngine::with_preview_host("host")
        .script("npm install", Script::exits(0))
        .script("npm run dev", Script::serves(4000))
}

fn project() -> ProjectFileSet {
    ProjectFileSet::from_entries([
        ("package.json", r#"{"name":"demo"}"#),
        ("src/App.jsx", "app"),
    ])
    .unwrap()
}

async fn open(
    engine: &MemoryEngine,
    registry: &Arc<RoomRegistry>,
    config: WorkspaceConfig,
) -> Result<Arc<Workspace>, SandboxError> {
    let (session, events) = registry.connect().await;
    let link = Arc::new(registry.link(session));
    let workspace = Workspace::open(Arc::new(engine.clone()), PROJECT, project(), link, config).await?;
    workspace.spawn_event_pump(events);
    Ok(workspace)
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn open_reaches_ready_with_one_terminal() {
    let registry = Arc::new(RoomRegistry::new());
    let engine = engine();
    let Ok(ws) = open(&engine, &registry, WorkspaceConfig::default()).await else {
        panic!("workspace did not open");
    };

    let ready = ws.wait_ready().await.unwrap();
    assert_eq!(ready.url, "http://host:4000");
    assert_eq!(ws.preview_url().as_deref(), Some("http://host:4000"));
    assert_eq!(ws.terminals().len().await, 1);
    assert!(ws.terminals().active().is_some());
    assert_eq!(registry.room_size(PROJECT).await, Some(1));
    eventually(|| {
        let ws = Arc::clone(&ws);
        async move { ws.user_count() == 1 }
    })
    .await;
}

#[tokio::test]
async fn local_edits_reach_peers_but_not_their_runtimes() {
    let registry = Arc::new(RoomRegistry::new());
    let (engine1, engine2) = (engine(), engine());
    let Ok(ws1) = open(&engine1, &registry, WorkspaceConfig::default()).await else {
        panic!("first workspace did not open");
    };
    let Ok(ws2) = open(&engine2, &registry, WorkspaceConfig::default()).await else {
        panic!("second workspace did not open");
    };
    eventually(|| {
        let ws1 = Arc::clone(&ws1);
        async move { ws1.user_count() == 2 }
    })
    .await;

    let outcome = ws1.edit("src/App.jsx", "X").await.unwrap();
    assert!(outcome.is_complete());
    let runtime1 = engine1.last_runtime().unwrap();
    assert_eq!(runtime1.file("src/App.jsx").as_deref(), Some("X"));

    eventually(|| {
        let ws2 = Arc::clone(&ws2);
        async move {
            let reached = ws2.files().read().await.get("src/App.jsx") == Some("X");
            reached
        }
    })
    .await;
    let runtime2 = engine2.last_runtime().unwrap();
    assert_eq!(runtime2.file("src/App.jsx").as_deref(), Some("app"));

    ws1.create_file("src/new.js", "n").await.unwrap();
    eventually(|| {
        let ws2 = Arc::clone(&ws2);
        async move {
            let reached = ws2.files().read().await.contains("src/new.js");
            reached
        }
    })
    .await;
    assert_eq!(runtime2.file("src/new.js"), None);
}

#[tokio::test]
async fn boot_failure_tears_the_workspace_down() {
    let registry = Arc::new(RoomRegistry::new());
    let engine = MemoryEngine::new().fail_boot("cross-origin isolation unavailable");

    let err = open(&engine, &registry, WorkspaceConfig::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SandboxError::Boot(_)));
    assert!(engine.runtimes().is_empty());
    assert_eq!(registry.room_size(PROJECT).await, None);
}

#[tokio::test]
async fn install_failure_leaves_a_restartable_workspace() {
    let registry = Arc::new(RoomRegistry::new());
    let engine = engine().script("npm install", Script::exits(1).with_output("ERESOLVE"));
    let mut config = WorkspaceConfig::default();
    config.pipeline.install_policy = InstallPolicy::Halt;

    let Ok(ws) = open(&engine, &registry, config).await else {
        panic!("install failure must not be fatal");
    };
    assert_eq!(ws.sandbox().state(), SandboxState::Failed);
    assert!(ws.terminals().is_empty().await);
    assert!(matches!(ws.wait_ready().await, Err(SandboxError::Install(_))));

    engine.set_script("npm install", Script::exits(0));
    let ready = ws.restart_runtime().await.unwrap();
    assert_eq!(ready.url, "http://host:4000");
    assert_eq!(ws.terminals().len().await, 1);
    assert_eq!(engine.runtimes().len(), 2);
    assert!(engine.runtimes()[0].is_torn_down());
}

#[tokio::test]
async fn teardown_releases_everything_once() {
    let registry = Arc::new(RoomRegistry::new());
    let engine = engine();
    let Ok(ws) = open(&engine, &registry, WorkspaceConfig::default()).await else {
        panic!("workspace did not open");
    };
    ws.wait_ready().await.unwrap();

    ws.teardown().await;
    ws.teardown().await;

    assert!(ws.is_torn_down());
    assert_eq!(ws.sandbox().state(), SandboxState::Disposed);
    assert!(ws.terminals().is_empty().await);
    let runtime = engine.last_runtime().unwrap();
    assert!(runtime.is_torn_down());
    assert_eq!(runtime.running("npm run dev"), 0);
    assert_eq!(registry.room_size(PROJECT).await, None);
    assert!(matches!(
        ws.restart_runtime().await,
        Err(SandboxError::Disposed)
    ));
}

#[tokio::test]
async fn generated_manifest_change_reinstalls_and_is_shared() {
    let registry = Arc::new(RoomRegistry::new());
    let (engine1, engine2) = (engine(), engine());
    let Ok(ws1) = open(&engine1, &registry, WorkspaceConfig::default()).await else {
        panic!("first workspace did not open");
    };
    let Ok(ws2) = open(&engine2, &registry, WorkspaceConfig::default()).await else {
        panic!("second workspace did not open");
    };
    ws1.wait_ready().await.unwrap();

    let generated: GenerateResponse = serde_json::from_str(
        r#"{
            "files": {
                "package.json": "{\"name\":\"demo\",\"dependencies\":{\"react-router\":\"6\"}}",
                "src/Nav.jsx": "nav"
            },
            "description": "add routing"
        }"#,
    )
    .unwrap();
    let report = ws1.apply_generated(generated).await.unwrap();
    assert!(report.reinstalled);
    assert!(report.failed.is_empty());

    let runtime = engine1.last_runtime().unwrap();
    assert_eq!(runtime.spawn_count("npm install"), 2);
    assert_eq!(runtime.spawn_count("npm run dev"), 2);
    assert_eq!(runtime.running("npm run dev"), 1);
    assert_eq!(runtime.file("src/Nav.jsx").as_deref(), Some("nav"));
    assert_eq!(ws1.sandbox().state(), SandboxState::Ready);

    eventually(|| {
        let ws2 = Arc::clone(&ws2);
        async move {
            let reached = ws2.files().read().await.get("src/Nav.jsx") == Some("nav");
            reached
        }
    })
    .await;
}

#[tokio::test]
async fn save_persists_the_current_files() {
    let registry = Arc::new(RoomRegistry::new());
    let engine = engine();
    let Ok(ws) = open(&engine, &registry, WorkspaceConfig::default()).await else {
        panic!("workspace did not open");
    };
    ws.edit("src/App.jsx", "saved").await.unwrap();

    let store = MemoryStore::new();
    ws.save(&store).await.unwrap();
    let stored = store.list_files(PROJECT).await.unwrap();
    assert_eq!(stored.get("src/App.jsx"), Some("saved"));
    assert!(stored.contains("package.json"));
}

#[tokio::test]
async fn shared_terminal_output_is_mirrored_to_peers() {
    let registry = Arc::new(RoomRegistry::new());
    let (engine1, engine2) = (engine(), engine());
    let Ok(ws1) = open(&engine1, &registry, WorkspaceConfig::default()).await else {
        panic!("first workspace did not open");
    };
    let Ok(ws2) = open(&engine2, &registry, WorkspaceConfig::default()).await else {
        panic!("second workspace did not open");
    };
    let mut mirrored = ws2.subscribe_shared_terminals();
    let mut own = ws1.subscribe_shared_terminals();

    let id = ws1.terminals().active().unwrap();
    ws1.terminals().set_shared(id, true).await.unwrap();
    ws1.terminals().write(id, b"ls\n".to_vec()).await.unwrap();

    let data = timeout(Duration::from_secs(5), mirrored.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data, "ls\n");
    assert!(timeout(Duration::from_millis(200), own.recv()).await.is_err());
}
