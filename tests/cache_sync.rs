// List cache behavior against a mock server: full vs delta fetches,
// filter bypass, and types with caching disabled

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

use graphdesk::api::auth::SessionStore;
use graphdesk::api::ApiClient;
use graphdesk::cache::SummaryCache;
use graphdesk::config::ServerConfig;
use graphdesk::service::DeskService;

// ========== Mock server ==========

#[derive(Default)]
struct Counters {
    person_full: usize,
    person_delta: usize,
    person_filtered: usize,
    draft_full: usize,
}

#[derive(Default)]
struct MockLists {
    person: Vec<Value>,
    /// Served verbatim for `lastRefreshedTimestamp` requests; when null
    /// an empty delta goes out instead.
    person_delta: Value,
    drafts: Vec<Value>,
    counters: Counters,
}

type Shared = Arc<Mutex<MockLists>>;

fn schema_json() -> Value {
    json!({
        "person": {
            "app": "core",
            "top_level": true,
            "fields": {
                "label": { "type": "property", "property_type": "StringProperty" }
            },
            "reverse_relations": {},
            "meta": {
                "display_name": "Person",
                "display_name_plural": "People"
            },
            "json_schema": {}
        },
        "draft": {
            "app": "core",
            "top_level": true,
            "fields": {
                "label": { "type": "property", "property_type": "StringProperty" }
            },
            "reverse_relations": {},
            "meta": {
                "display_name": "Draft",
                "display_name_plural": "Drafts",
                "use_list_cache": false
            },
            "json_schema": {}
        }
    })
}

fn summary_row(uid: &str, label: &str) -> Value {
    json!({
        "uid": uid,
        "label": label,
        "real_type": "person",
        "is_deleted": false,
        "deleted_and_has_dependent_nodes": false,
        "is_merged_item": false,
        "merged_items": []
    })
}

fn draft_row(uid: &str, label: &str) -> Value {
    let mut row = summary_row(uid, label);
    row["real_type"] = json!("draft");
    row
}

async fn get_schema() -> Response {
    Json(schema_json()).into_response()
}

async fn list_person(
    State(db): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut db = db.lock().unwrap();
    if let Some(filter) = params.get("filter").cloned() {
        db.counters.person_filtered += 1;
        let needle = filter.to_lowercase();
        let matches: Vec<Value> = db
            .person
            .iter()
            .filter(|row| {
                row.get("label")
                    .and_then(Value::as_str)
                    .map(|l| l.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        return Json(Value::Array(matches)).into_response();
    }
    if params.contains_key("lastRefreshedTimestamp") {
        db.counters.person_delta += 1;
        let delta = if db.person_delta.is_null() {
            json!({"created_modified": [], "deleted": []})
        } else {
            db.person_delta.clone()
        };
        return Json(delta).into_response();
    }
    db.counters.person_full += 1;
    Json(Value::Array(db.person.clone())).into_response()
}

async fn list_draft(State(db): State<Shared>) -> Response {
    let mut db = db.lock().unwrap();
    db.counters.draft_full += 1;
    Json(Value::Array(db.drafts.clone())).into_response()
}

fn router(db: Shared) -> Router {
    Router::new()
        .route("/api/schema/", get(get_schema))
        .route("/api/core/person/", get(list_person))
        .route("/api/core/draft/", get(list_draft))
        .with_state(db)
}

async fn spawn_app(db: Shared) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(db)).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn desk(url: &str) -> (TempDir, DeskService) {
    let dir = tempdir().unwrap();
    let api = ApiClient::new(
        &ServerConfig {
            url: url.to_string(),
            request_timeout_secs: 5,
        },
        SessionStore::new(dir.path().join("session.json")),
    )
    .unwrap();
    let schema = api.fetch_schema().await.unwrap();
    let cache = SummaryCache::open_in_memory().await.unwrap();
    (dir, DeskService::new(api, cache, schema, 10))
}

// ========== Tests ==========

#[tokio::test]
async fn test_first_list_is_full_then_delta() {
    let db: Shared = Arc::new(Mutex::new(MockLists::default()));
    db.lock().unwrap().person = vec![summary_row("p1", "Ada")];
    let url = spawn_app(db.clone()).await;
    let (_dir, service) = desk(&url).await;

    let items = service.list("person", None).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].label, "Ada");

    {
        let mut locked = db.lock().unwrap();
        locked.person_delta = json!({
            "created_modified": [summary_row("p2", "Byron")],
            "deleted": [{"uid": "p1"}]
        });
    }

    let items = service.list("person", None).await.unwrap();
    let labels: Vec<&str> = items.iter().map(|i| i.label.as_str()).collect();
    assert_eq!(labels, vec!["Byron"]);

    let locked = db.lock().unwrap();
    assert_eq!(locked.counters.person_full, 1);
    assert_eq!(locked.counters.person_delta, 1);
}

#[tokio::test]
async fn test_reapplying_the_same_delta_converges() {
    let db: Shared = Arc::new(Mutex::new(MockLists::default()));
    db.lock().unwrap().person = vec![summary_row("p1", "Ada")];
    let url = spawn_app(db.clone()).await;
    let (_dir, service) = desk(&url).await;

    service.list("person", None).await.unwrap();
    {
        let mut locked = db.lock().unwrap();
        locked.person_delta = json!({
            "created_modified": [summary_row("p2", "Byron")],
            "deleted": [{"uid": "ghost"}]
        });
    }

    let once = service.list("person", None).await.unwrap();
    let twice = service.list("person", None).await.unwrap();
    assert_eq!(once, twice);
    let labels: Vec<&str> = twice.iter().map(|i| i.label.as_str()).collect();
    assert_eq!(labels, vec!["Ada", "Byron"]);

    let locked = db.lock().unwrap();
    assert_eq!(locked.counters.person_delta, 2);
}

#[tokio::test]
async fn test_filtered_queries_bypass_the_cache() {
    let db: Shared = Arc::new(Mutex::new(MockLists::default()));
    db.lock().unwrap().person = vec![summary_row("p1", "Ada"), summary_row("p2", "Byron")];
    let url = spawn_app(db.clone()).await;
    let (_dir, service) = desk(&url).await;

    let hits = service.list("person", Some("byr")).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].label, "Byron");
    {
        let locked = db.lock().unwrap();
        assert_eq!(locked.counters.person_filtered, 1);
        assert_eq!(locked.counters.person_full, 0);
    }

    // The filtered call left no refresh stamp, so the next plain list
    // still fetches in full.
    let all = service.list("person", None).await.unwrap();
    assert_eq!(all.len(), 2);
    let locked = db.lock().unwrap();
    assert_eq!(locked.counters.person_full, 1);
    assert_eq!(locked.counters.person_delta, 0);
}

#[tokio::test]
async fn test_uncached_types_always_fetch_in_full() {
    let db: Shared = Arc::new(Mutex::new(MockLists::default()));
    db.lock().unwrap().drafts = vec![draft_row("d1", "First draft")];
    let url = spawn_app(db.clone()).await;
    let (_dir, service) = desk(&url).await;

    let first = service.list("draft", None).await.unwrap();
    let second = service.list("draft", None).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);

    let locked = db.lock().unwrap();
    assert_eq!(locked.counters.draft_full, 2);
    assert_eq!(locked.counters.person_delta, 0);
}

#[tokio::test]
async fn test_refresh_drops_the_cached_list() {
    let db: Shared = Arc::new(Mutex::new(MockLists::default()));
    db.lock().unwrap().person = vec![summary_row("p1", "Ada")];
    let url = spawn_app(db.clone()).await;
    let (_dir, service) = desk(&url).await;

    service.list("person", None).await.unwrap();
    let refreshed = service.refresh_list("person").await.unwrap();
    assert_eq!(refreshed.len(), 1);

    // Both calls fetched in full; the refresh wiped the stamp instead
    // of asking for a delta.
    let locked = db.lock().unwrap();
    assert_eq!(locked.counters.person_full, 2);
    assert_eq!(locked.counters.person_delta, 0);
}
