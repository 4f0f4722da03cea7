use std::time::Duration;

use devroom::client::PresenceClient;
use devroom::presence::{ClientEvent, ServerEvent};
use devroom::state::AppState;
use devroom::ws_server::build_router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

async fn start_server() -> (String, AppState) {
    let state = AppState::default();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("127.0.0.1:{}", addr.port()), state)
}

async fn next_event(rx: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn assert_quiet(rx: &mut UnboundedReceiver<ServerEvent>) {
    let got = timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(got.is_err(), "unexpected event: {got:?}");
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn two_clients_share_a_room() {
    let (addr, state) = start_server().await;
    let url = format!("ws://{addr}/ws");

    let (c1, mut rx1) = PresenceClient::connect(&url).await.unwrap();
    c1.send(ClientEvent::JoinProject("proj1".into())).unwrap();
    assert_eq!(
        next_event(&mut rx1).await,
        ServerEvent::Joined {
            project_id: "proj1".into(),
            session_id: c1.session_id(),
            user_count: 1,
        }
    );

    let (c2, mut rx2) = PresenceClient::connect(&url).await.unwrap();
    c2.send(ClientEvent::JoinProject("proj1".into())).unwrap();
    assert_eq!(
        next_event(&mut rx1).await,
        ServerEvent::UserJoined {
            session_id: c2.session_id(),
            user_count: 2,
        }
    );
    assert_eq!(
        next_event(&mut rx2).await,
        ServerEvent::Joined {
            project_id: "proj1".into(),
            session_id: c2.session_id(),
            user_count: 2,
        }
    );

    c1.send(ClientEvent::FileChange {
        project_id: "proj1".into(),
        path: "src/App.jsx".into(),
        content: "X".into(),
    })
    .unwrap();
    assert_eq!(
        next_event(&mut rx2).await,
        ServerEvent::FileUpdated {
            path: "src/App.jsx".into(),
            content: "X".into(),
        }
    );
    assert_quiet(&mut rx1).await;

    let departed = c2.session_id();
    drop(c2);
    assert_eq!(
        next_event(&mut rx1).await,
        ServerEvent::UserLeft {
            session_id: departed,
            user_count: 1,
        }
    );
    assert_eq!(state.registry.room_size("proj1").await, Some(1));
}

#[tokio::test]
async fn terminal_data_reaches_peers_only() {
    let (addr, _state) = start_server().await;
    let url = format!("ws://{addr}/ws");

    let (c1, mut rx1) = PresenceClient::connect(&url).await.unwrap();
    let (c2, mut rx2) = PresenceClient::connect(&url).await.unwrap();
    c1.send(ClientEvent::JoinProject("p".into())).unwrap();
    next_event(&mut rx1).await;
    c2.send(ClientEvent::JoinProject("p".into())).unwrap();
    next_event(&mut rx1).await;
    next_event(&mut rx2).await;

    c2.send(ClientEvent::TerminalInput {
        project_id: "p".into(),
        data: "$ npm test\r\n".into(),
    })
    .unwrap();
    assert_eq!(
        next_event(&mut rx1).await,
        ServerEvent::TerminalOutput("$ npm test\r\n".into())
    );
    assert_quiet(&mut rx2).await;
}

#[tokio::test]
async fn rejected_events_come_back_as_errors() {
    let (addr, _state) = start_server().await;
    let (mut socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();

    let connected = timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let connected: serde_json::Value =
        serde_json::from_str(connected.to_text().unwrap()).unwrap();
    assert_eq!(connected["event"], "connected");
    assert!(connected["data"]["sessionId"].is_string());

    socket
        .send(Message::Text(
            r#"{"event":"file-change","data":{"projectId":"nope","path":"a.js","content":""}}"#
                .into(),
        ))
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply["event"], "error");
    assert!(reply["data"]["message"]
        .as_str()
        .unwrap()
        .contains("not in room"));

    socket.send(Message::Text("not json".into())).await.unwrap();
    let reply = timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply["event"], "error");
}

#[tokio::test]
async fn http_endpoints_report_rooms() {
    let (addr, _state) = start_server().await;
    let http = http_client();

    let health = http
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap();
    assert!(health.status().is_success());
    assert_eq!(health.text().await.unwrap(), "OK");

    let (client, mut rx) = PresenceClient::connect(&format!("ws://{addr}/ws"))
        .await
        .unwrap();
    client.send(ClientEvent::JoinProject("demo".into())).unwrap();
    next_event(&mut rx).await;

    let rooms: serde_json::Value = http
        .get(format!("http://{addr}/rooms"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rooms[0]["project_id"], "demo");
    assert_eq!(rooms[0]["user_count"], 1);

    let missing = http
        .get(format!("http://{addr}/rooms/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}
