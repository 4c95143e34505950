use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tether_client::{ClientError, ClientOptions, HubClient};
use tether_core::{aituber_text, execute_js, execute_js_result, AituberTextPayload, Role};
use tether_hub::{config::HubConfig, serve, Hub};
use tokio::net::TcpListener;
use url::Url;

async fn launch_hub() -> (SocketAddr, Arc<Hub>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let config = HubConfig {
        request_timeout: Duration::from_millis(500),
        stale_after: Duration::ZERO,
        ping_interval: Duration::ZERO,
        ..HubConfig::default()
    };
    let hub = Hub::new(config, None);
    tokio::spawn(serve(listener, hub.clone()));
    (addr, hub)
}

fn options(addr: SocketAddr, id: &str, roles: Vec<Role>) -> ClientOptions {
    let url = Url::parse(&format!("ws://{addr}/ws")).expect("url");
    let mut options = ClientOptions::new(url, id, roles);
    options.timeout = Duration::from_secs(3);
    options
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_round_trips_through_editor() {
    let (addr, _hub) = launch_hub().await;
    let mut editor = HubClient::connect(options(addr, "inject-1", vec![Role::EditorClient]))
        .await
        .expect("editor");
    assert!(editor.roles().contains("editor_client"));

    let editor_task = tokio::spawn(async move {
        let request = editor.recv().await.expect("request");
        let request_id = request.request_id().expect("request id").to_string();
        let reply = execute_js_result(
            editor.id(),
            &request.from,
            &request_id,
            Ok(json!({"value": 2})),
        );
        editor.send(&reply).await.expect("reply");
        editor
    });

    let mut cc = HubClient::connect(options(addr, "cc-1", vec![Role::CommandClient]))
        .await
        .expect("command client");
    let reply = cc
        .request(&execute_js("cc-1", "editor", "1+1", "R-client-1"))
        .await
        .expect("reply");
    assert_eq!(reply.payload["success"], true);
    assert_eq!(reply.payload["result"]["value"], 2);
    assert_eq!(reply.payload["request_id"], "R-client-1");

    let editor = editor_task.await.expect("editor task");
    editor.close().await;
    cc.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hook_text_reaches_avatar() {
    let (addr, _hub) = launch_hub().await;
    let mut avatar = HubClient::connect(options(addr, "avatar-1", vec![Role::AituberClient]))
        .await
        .expect("avatar");
    let mut hook = HubClient::connect(options(addr, "hook-conv-1", vec![Role::AgentHook]))
        .await
        .expect("hook");

    let payload = AituberTextPayload {
        text: "build finished".to_string(),
        emotion: Some("happy".to_string()),
        event_type: Some("stop".to_string()),
        ..AituberTextPayload::default()
    };
    hook.send(&aituber_text(hook.id(), &payload)).await.expect("send");

    let received = avatar
        .recv_timeout(Duration::from_secs(3))
        .await
        .expect("recv")
        .expect("envelope");
    assert_eq!(received.from, "hook-conv-1");
    assert_eq!(received.payload["text"], "build finished");
    assert!(avatar
        .recv_timeout(Duration::from_millis(200))
        .await
        .expect("recv")
        .is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_role_registration_is_rejected() {
    let (addr, _hub) = launch_hub().await;
    let err = HubClient::connect(options(addr, "nobody", Vec::new()))
        .await
        .err()
        .expect("rejected");
    assert!(matches!(err, ClientError::Rejected(reason) if reason == "invalid role"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_times_out_without_editor_reply() {
    let (addr, _hub) = launch_hub().await;
    let _editor = HubClient::connect(options(addr, "inject-quiet", vec![Role::EditorClient]))
        .await
        .expect("editor");
    let mut cc = HubClient::connect(options(addr, "cc-2", vec![Role::CommandClient]))
        .await
        .expect("command client");
    let reply = cc
        .request(&execute_js("cc-2", "inject-quiet", "hang()", "R-client-2"))
        .await
        .expect("timeout reply");
    assert_eq!(reply.from, "server");
    assert_eq!(reply.payload["success"], false);
    assert_eq!(reply.payload["error"], "timeout");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_connects_once_hub_is_up() {
    let (addr, _hub) = launch_hub().await;
    let opts = options(addr, "cc-retry", vec![Role::CommandClient]);
    let client = HubClient::connect_with_retry(opts, 3)
        .await
        .expect("connected");
    assert_eq!(client.id(), "cc-retry");
    client.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_gives_up_after_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let started = tokio::time::Instant::now();
    let opts = options(addr, "cc-late", vec![Role::CommandClient]);
    let err = HubClient::connect_with_retry(opts, 2)
        .await
        .err()
        .expect("no hub");
    assert!(matches!(err, ClientError::Ws(_)), "unexpected error: {err}");
    // One backoff of a second separates the two attempts.
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_registration_is_not_retried() {
    let (addr, _hub) = launch_hub().await;
    let started = tokio::time::Instant::now();
    let err = HubClient::connect_with_retry(options(addr, "nobody", Vec::new()), 0)
        .await
        .err()
        .expect("rejected");
    assert!(matches!(err, ClientError::Rejected(_)));
    assert!(started.elapsed() < Duration::from_secs(1));
}
