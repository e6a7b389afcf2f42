//! Integration tests for the video-call directory client and the incoming
//! call watcher, against a mock platform API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use lectern_call::{
    watch_incoming, CallDirectory, CallError, CallId, CallStatus, NewVideoCall,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;

/// Calls known to the mock backend.
#[derive(Clone, Default)]
struct Backend {
    calls: Arc<Mutex<Vec<Value>>>,
}

impl Backend {
    fn insert(&self, id: &str, title: &str, status: &str) {
        self.calls.lock().unwrap().push(json!({
            "id": id,
            "title": title,
            "hostName": "Ada",
            "status": status,
            "participants": ["Ada", "Ben"],
        }));
    }

    fn with_status(&self, status: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c["status"] == status)
            .cloned()
            .collect()
    }
}

async fn incoming(State(backend): State<Backend>) -> Json<Value> {
    Json(json!({ "data": backend.with_status("ringing") }))
}

async fn history(State(backend): State<Backend>) -> Json<Value> {
    let mut done = backend.with_status("ended");
    done.extend(backend.with_status("rejected"));
    Json(json!(done))
}

async fn create(State(backend): State<Backend>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let id = format!("c{}", backend.calls.lock().unwrap().len() + 1);
    let title = body["title"].as_str().unwrap_or_default().to_string();
    backend.insert(&id, &title, "ringing");
    let created = backend
        .calls
        .lock()
        .unwrap()
        .last()
        .cloned()
        .unwrap_or_default();
    (StatusCode::CREATED, Json(json!({ "data": created })))
}

async fn action(
    State(backend): State<Backend>,
    Path((id, action)): Path<(String, String)>,
) -> (StatusCode, Json<Value>) {
    let next = match action.as_str() {
        "accept" | "join" => "active",
        "reject" => "rejected",
        "end" => "ended",
        _ => return (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown action" }))),
    };
    let mut calls = backend.calls.lock().unwrap();
    let Some(call) = calls.iter_mut().find(|c| c["id"] == id.as_str()) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": format!("call {id} not found") })),
        );
    };
    if call["status"] == "ended" {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "call already ended" })),
        );
    }
    call["status"] = json!(next);
    (StatusCode::OK, Json(json!({ "data": call.clone() })))
}

async fn spawn_backend(backend: Backend) -> String {
    let router = Router::new()
        .route("/api/video-calls", post(create))
        .route("/api/video-calls/incoming", get(incoming))
        .route("/api/video-calls/history", get(history))
        .route("/api/video-calls/:id/:action", post(action))
        .with_state(backend);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });
    format!("http://{addr}/api")
}

// ============================================================================
// Directory Tests
// ============================================================================

#[tokio::test]
async fn test_call_lifecycle_through_directory() {
    let backend = Backend::default();
    let directory = CallDirectory::new(&spawn_backend(backend.clone()).await).unwrap();

    let created = directory
        .create_call(&NewVideoCall {
            title: "Office hours".to_string(),
            participant_ids: vec!["ben".to_string()],
            scheduled_at: None,
        })
        .await
        .unwrap();
    assert_eq!(created.status, CallStatus::Ringing);
    assert_eq!(created.title, "Office hours");

    let ringing = directory.incoming().await.unwrap();
    assert_eq!(ringing.len(), 1);
    assert_eq!(ringing[0].id, created.id);

    let accepted = directory.accept(&created.id).await.unwrap();
    assert_eq!(accepted.status, CallStatus::Active);
    assert!(directory.incoming().await.unwrap().is_empty());

    let ended = directory.end(&created.id).await.unwrap();
    assert_eq!(ended.status, CallStatus::Ended);

    let history = directory.history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].status.is_open());
}

#[tokio::test]
async fn test_backend_errors_surface_as_api_errors() {
    let backend = Backend::default();
    backend.insert("c1", "Review", "ended");
    let directory = CallDirectory::new(&spawn_backend(backend).await).unwrap();

    let err = directory.join(&CallId::from("c1")).await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Api { status: 409, ref message } if message == "call already ended"
    ));

    let err = directory.reject(&CallId::from("c404")).await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Api { status: 404, ref message } if message == "call c404 not found"
    ));
}

// ============================================================================
// Watcher Tests
// ============================================================================

#[tokio::test]
async fn test_incoming_watch_publishes_new_calls() {
    let backend = Backend::default();
    let directory = CallDirectory::new(&spawn_backend(backend.clone()).await).unwrap();

    let (mut handle, mut rx) = watch_incoming(directory, Duration::from_millis(100)).unwrap();

    timeout(Duration::from_secs(5), rx.changed())
        .await
        .expect("first refresh")
        .unwrap();
    assert!(rx.borrow_and_update().is_empty());

    backend.insert("c7", "Pairing session", "ringing");
    timeout(Duration::from_secs(5), async {
        loop {
            rx.changed().await.unwrap();
            if !rx.borrow_and_update().is_empty() {
                break;
            }
        }
    })
    .await
    .expect("new call published");
    assert_eq!(rx.borrow()[0].id, CallId::from("c7"));

    assert!(handle.is_active());
    assert!(handle.ticks() >= 1);
    assert!(handle.cancel());
    assert!(!handle.cancel());
}
