use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use station_relay::metadata::ResolvedMetadata;
use station_relay::publisher::{
    load_snapshot, persist_snapshot, AdminTarget, MetadataPublisher,
};

#[derive(Debug, Clone)]
struct AdminRequest {
    params: HashMap<String, String>,
    authorization: Option<String>,
}

#[derive(Clone, Default)]
struct AdminState {
    requests: Arc<Mutex<Vec<AdminRequest>>>,
}

/// Mimics the streaming server's admin endpoint; "/broken.mp3" is rejected
async fn admin_metadata_handler(
    State(state): State<AdminState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let broken = params.get("mount").map(String::as_str) == Some("/broken.mp3");
    state.requests.lock().unwrap().push(AdminRequest {
        params,
        authorization,
    });
    if broken {
        (StatusCode::BAD_REQUEST, "Mount not found")
    } else {
        (StatusCode::OK, "Metadata update successful")
    }
}

async fn start_admin_server() -> (String, AdminState) {
    let state = AdminState::default();
    let app = Router::new()
        .route("/admin/metadata", get(admin_metadata_handler))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), state)
}

fn target(base_url: String, mounts: &[&str]) -> AdminTarget {
    AdminTarget {
        base_url,
        username: "source".to_string(),
        password: "hackme".to_string(),
        mounts: mounts.iter().map(|m| m.to_string()).collect(),
        mode: "updinfo".to_string(),
        timeout: Duration::from_secs(2),
    }
}

fn meta(title: &str, timestamp: &str) -> ResolvedMetadata {
    ResolvedMetadata {
        title: title.to_string(),
        artist: "WKMG-DT1".to_string(),
        comment: "ClickOrlando / News 6".to_string(),
        genre: "Television".to_string(),
        artwork: "https://img/show.png".to_string(),
        timestamp: timestamp.to_string(),
    }
}

async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        handle.await.unwrap();
    }
}

#[test]
fn test_update_url_encodes_song() {
    let admin = target("http://radio.example:8000".to_string(), &["/live.mp3"]);
    let url = admin.update_url("/live.mp3", "News & Weather").unwrap();
    assert_eq!(url.path(), "/admin/metadata");
    let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
    assert_eq!(pairs["mount"], "/live.mp3");
    assert_eq!(pairs["mode"], "updinfo");
    assert_eq!(pairs["song"], "News & Weather");

    let bad = target("not a url".to_string(), &["/live.mp3"]);
    assert!(bad.update_url("/live.mp3", "x").is_err());
}

#[tokio::test]
async fn test_push_on_change_to_every_mount() {
    let (base_url, admin) = start_admin_server().await;
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("currentMetadata.json");
    let mut publisher = MetadataPublisher::new(
        state_path.clone(),
        Some(target(base_url, &["/live.mp3", "/live.aac"])),
    )
    .unwrap();

    join_all(publisher.publish(&meta("Morning Show", "2024-01-01T06:00:00.000Z"))).await;
    {
        let requests = admin.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let mut mounts: Vec<&str> = requests.iter().map(|r| r.params["mount"].as_str()).collect();
        mounts.sort();
        assert_eq!(mounts, vec!["/live.aac", "/live.mp3"]);
        for request in requests.iter() {
            assert_eq!(request.params["song"], "Morning Show");
            assert_eq!(request.params["mode"], "updinfo");
            // base64("source:hackme")
            assert_eq!(
                request.authorization.as_deref(),
                Some("Basic c291cmNlOmhhY2ttZQ==")
            );
        }
    }

    // only the timestamp moved: persisted, not pushed
    let handles = publisher.publish(&meta("Morning Show", "2024-01-01T06:00:01.000Z"));
    assert!(handles.is_empty());
    assert_eq!(admin.requests.lock().unwrap().len(), 2);
    assert_eq!(
        load_snapshot(&state_path).unwrap().timestamp,
        "2024-01-01T06:00:01.000Z"
    );

    join_all(publisher.publish(&meta("Late Show", "2024-01-01T09:00:00.000Z"))).await;
    assert_eq!(admin.requests.lock().unwrap().len(), 4);

    let status = publisher.push_status();
    assert_eq!(status.len(), 2);
    let live = status.get("/live.mp3").unwrap();
    assert!(live.ok);
    assert_eq!(live.title, "Late Show");
}

#[tokio::test]
async fn test_failing_mount_does_not_affect_others() {
    let (base_url, admin) = start_admin_server().await;
    let dir = tempfile::tempdir().unwrap();
    let mut publisher = MetadataPublisher::new(
        dir.path().join("state.json"),
        Some(target(base_url, &["/broken.mp3", "/live.mp3"])),
    )
    .unwrap();

    join_all(publisher.publish(&meta("Morning Show", "2024-01-01T06:00:00.000Z"))).await;

    assert_eq!(admin.requests.lock().unwrap().len(), 2);
    let status = publisher.push_status();
    let broken = status.get("/broken.mp3").unwrap();
    assert!(!broken.ok);
    assert!(broken.error.as_deref().unwrap().contains("400"));
    assert!(status.get("/live.mp3").unwrap().ok);
}

#[tokio::test]
async fn test_unreachable_admin_is_recorded() {
    // bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let mut publisher = MetadataPublisher::new(
        state_path.clone(),
        Some(target(format!("http://{}", addr), &["/live.mp3"])),
    )
    .unwrap();

    let current = meta("Morning Show", "2024-01-01T06:00:00.000Z");
    join_all(publisher.publish(&current)).await;

    assert!(!publisher.push_status().get("/live.mp3").unwrap().ok);
    // local state is still written
    assert_eq!(load_snapshot(&state_path).unwrap(), current);
}

#[tokio::test]
async fn test_seeded_value_is_not_pushed_again() {
    let (base_url, admin) = start_admin_server().await;
    let dir = tempfile::tempdir().unwrap();
    let mut publisher = MetadataPublisher::new(
        dir.path().join("state.json"),
        Some(target(base_url, &["/live.mp3"])),
    )
    .unwrap();

    publisher.seed(meta("Morning Show", "2024-01-01T05:59:00.000Z"));
    let handles = publisher.publish(&meta("Morning Show", "2024-01-01T06:00:00.000Z"));
    assert!(handles.is_empty());
    assert!(admin.requests.lock().unwrap().is_empty());
}

#[test]
fn test_snapshot_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("currentMetadata.json");
    let current = meta("Evening News", "2024-01-01T18:00:00.000Z");

    persist_snapshot(&path, &current).unwrap();
    assert_eq!(load_snapshot(&path).unwrap(), current);

    // overwrite in place, no temp files left behind
    let next = meta("Late Show", "2024-01-01T23:30:00.000Z");
    persist_snapshot(&path, &next).unwrap();
    assert_eq!(load_snapshot(&path).unwrap(), next);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["title"], "Late Show");
    assert_eq!(raw["genre"], "Television");
}

#[test]
fn test_missing_or_corrupt_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    assert!(load_snapshot(&path).is_none());

    std::fs::write(&path, "{ not json").unwrap();
    assert!(load_snapshot(&path).is_none());

    // unwritable location reports an error instead of panicking
    let missing_dir = dir.path().join("nope").join("state.json");
    assert!(persist_snapshot(&missing_dir, &meta("x", "y")).is_err());
}
