//! End-to-end tests of the imposter and stub repositories against a real
//! (temporary) data directory, including the multi-writer behaviors the
//! on-disk locking protocol is there for.

use mirage_store::{fs, ImposterRepository, Stub};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn imposter_value(port: u16) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("port".to_string(), json!(port));
    map.insert("protocol".to_string(), json!("http"));
    map
}

fn stub(predicates: Value, responses: Vec<Value>) -> Stub {
    Stub {
        predicates: vec![predicates],
        responses,
    }
}

async fn body_of(handle: &mirage_store::StubHandle) -> String {
    let response = handle.next_response().await.unwrap();
    response.json()["is"]["body"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn create_with_stubs_lays_out_the_imposter_directory() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path());
    let stubs = repo.stubs_for(4545);

    stubs
        .insert_at_index(
            stub(json!({"equals": {"path": "/"}}), vec![json!({"is": {"body": "hi"}})]),
            0,
        )
        .await
        .unwrap();

    let imposter_dir = dir.path().join("4545");
    let meta = fs::read_json(&imposter_dir.join("stubs/0/meta.json"))
        .await
        .unwrap();
    assert_eq!(
        meta,
        Some(json!({
            "responseFiles": ["responses/0.json"],
            "orderWithRepeats": [0],
            "nextIndex": 0
        }))
    );

    let header = fs::read_json(&imposter_dir.join("imposter.json"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header["stubs"][0]["meta"]["dir"], json!("stubs/0"));
    assert_eq!(
        header["stubs"][0]["predicates"],
        json!([{"equals": {"path": "/"}}])
    );
}

#[tokio::test]
async fn repeat_counts_shape_the_response_cycle() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path());
    let stubs = repo.stubs_for(4545);

    stubs
        .add(stub(
            json!({"equals": {"path": "/"}}),
            vec![
                json!({"is": {"body": "A"}, "_behaviors": {"repeat": 2}}),
                json!({"is": {"body": "B"}}),
            ],
        ))
        .await
        .unwrap();

    let found = stubs.first(|_| true, 0).await.unwrap();
    assert_eq!(body_of(&found.stub).await, "A");
    assert_eq!(body_of(&found.stub).await, "A");
    assert_eq!(body_of(&found.stub).await, "B");
    assert_eq!(body_of(&found.stub).await, "A");

    let meta = fs::read_json(&dir.path().join("4545/stubs/0/meta.json"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta["nextIndex"], json!(1));
}

#[tokio::test]
async fn inserting_ahead_never_renumbers_existing_stubs() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path());
    let stubs = repo.stubs_for(4545);

    stubs
        .add(stub(json!({"equals": {"path": "/x"}}), vec![json!({"is": {"body": "x"}})]))
        .await
        .unwrap();
    stubs
        .insert_at_index(
            stub(json!({"equals": {"path": "/y"}}), vec![json!({"is": {"body": "y"}})]),
            0,
        )
        .await
        .unwrap();

    let header = fs::read_json(&dir.path().join("4545/imposter.json"))
        .await
        .unwrap()
        .unwrap();
    // Y sits first in the list but gets the next number, X keeps its dir.
    assert_eq!(header["stubs"][0]["meta"]["dir"], json!("stubs/1"));
    assert_eq!(header["stubs"][1]["meta"]["dir"], json!("stubs/0"));
}

#[tokio::test]
async fn deleted_stub_numbers_are_never_reissued() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path());
    let stubs = repo.stubs_for(4545);

    stubs
        .add(stub(json!({"equals": {"path": "/"}}), vec![json!({"is": {"body": "old"}})]))
        .await
        .unwrap();
    stubs.delete_at_index(0).await.unwrap();
    assert!(!dir.path().join("4545/stubs/0").exists());

    stubs
        .add(stub(json!({"equals": {"path": "/"}}), vec![json!({"is": {"body": "new"}})]))
        .await
        .unwrap();

    let header = fs::read_json(&dir.path().join("4545/imposter.json"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header["stubs"][0]["meta"]["dir"], json!("stubs/1"));
}

#[tokio::test]
async fn overwrite_at_index_replaces_in_place() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path());
    let stubs = repo.stubs_for(4545);

    stubs
        .add(stub(json!({"equals": {"path": "/a"}}), vec![json!({"is": {"body": "a"}})]))
        .await
        .unwrap();
    stubs
        .add(stub(json!({"equals": {"path": "/b"}}), vec![json!({"is": {"body": "b"}})]))
        .await
        .unwrap();

    stubs
        .overwrite_at_index(
            stub(json!({"equals": {"path": "/c"}}), vec![json!({"is": {"body": "c"}})]),
            0,
        )
        .await
        .unwrap();

    let listed = stubs.to_json().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].predicates, vec![json!({"equals": {"path": "/c"}})]);
    assert_eq!(listed[1].predicates, vec![json!({"equals": {"path": "/b"}})]);
}

#[tokio::test]
async fn to_json_round_trips_through_overwrite_all() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path());
    let stubs = repo.stubs_for(4545);

    stubs
        .add(stub(
            json!({"equals": {"path": "/a"}}),
            vec![
                json!({"is": {"body": "a1"}, "_behaviors": {"repeat": 3}}),
                json!({"is": {"body": "a2"}}),
            ],
        ))
        .await
        .unwrap();
    stubs
        .add(stub(json!({"equals": {"path": "/b"}}), vec![json!({"is": {"body": "b1"}})]))
        .await
        .unwrap();

    let before = stubs.to_json().await.unwrap();
    stubs.overwrite_all(before.clone()).await.unwrap();
    let after = stubs.to_json().await.unwrap();

    // Same predicates, responses and order; only directory numbers moved on.
    assert_eq!(before, after);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_next_responses_on_one_stub_advance_the_cursor_exactly() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path());
    let stubs = repo.stubs_for(4545);

    stubs
        .add(stub(
            json!({"equals": {"path": "/"}}),
            vec![
                json!({"is": {"body": "A"}}),
                json!({"is": {"body": "B"}}),
                json!({"is": {"body": "C"}}),
            ],
        ))
        .await
        .unwrap();

    let calls = 10;
    let tasks: Vec<_> = (0..calls)
        .map(|_| {
            let stubs = Arc::clone(&stubs);
            tokio::spawn(async move {
                let found = stubs.first(|_| true, 0).await.unwrap();
                found.stub.next_response().await.unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let meta = fs::read_json(&dir.path().join("4545/stubs/0/meta.json"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta["nextIndex"], json!(calls % 3));
}

#[tokio::test(flavor = "multi_thread")]
async fn stubs_cycle_independently_under_concurrency() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path());
    let stubs = repo.stubs_for(4545);

    stubs
        .add(stub(json!({"equals": {"path": "/a"}}), vec![
            json!({"is": {"body": "a1"}}),
            json!({"is": {"body": "a2"}}),
        ]))
        .await
        .unwrap();
    stubs
        .add(stub(json!({"equals": {"path": "/b"}}), vec![
            json!({"is": {"body": "b1"}}),
            json!({"is": {"body": "b2"}}),
        ]))
        .await
        .unwrap();

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let stubs = Arc::clone(&stubs);
            tokio::spawn(async move {
                let start = if i % 2 == 0 { 0 } else { 1 };
                let found = stubs.first(|_| true, start).await.unwrap();
                found.stub.next_response().await.unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    // Ten advances each: both cursors are back where they started.
    for n in 0..2 {
        let meta = fs::read_json(&dir.path().join(format!("4545/stubs/{n}/meta.json")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta["nextIndex"], json!(0));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_request_recording_loses_nothing() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path());
    let stubs = repo.stubs_for(4545);

    let writes = 100;
    let tasks: Vec<_> = (0..writes)
        .map(|i| {
            let stubs = Arc::clone(&stubs);
            tokio::spawn(async move {
                stubs
                    .add_request(&json!({"method": "GET", "path": format!("/{i}")}))
                    .await
                    .unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let requests = stubs.load_requests().await.unwrap();
    assert_eq!(requests.len(), writes);
    for request in &requests {
        assert!(request["timestamp"].is_string());
    }
}

#[tokio::test]
async fn requests_from_other_processes_interleave_by_filename_order() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path());
    let stubs = repo.stubs_for(4545);
    let requests_dir = dir.path().join("4545/requests");

    // Files as another worker sharing the datadir would have written them.
    fs::write_json(&requests_dir.join("50-1-0.json"), &json!({"from": "other", "n": 0}))
        .await
        .unwrap();
    fs::write_json(&requests_dir.join("50-1-1.json"), &json!({"from": "other", "n": 1}))
        .await
        .unwrap();

    stubs.add_request(&json!({"from": "us"})).await.unwrap();

    let requests = stubs.load_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    // Epoch 50 predates anything we can write today.
    assert_eq!(requests[0]["from"], json!("other"));
    assert_eq!(requests[0]["n"], json!(0));
    assert_eq!(requests[1]["n"], json!(1));
    assert_eq!(requests[2]["from"], json!("us"));
}

#[tokio::test]
async fn delete_saved_requests_drops_the_log() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path());
    let stubs = repo.stubs_for(4545);

    stubs.add_request(&json!({"path": "/"})).await.unwrap();
    assert_eq!(stubs.load_requests().await.unwrap().len(), 1);

    stubs.delete_saved_requests().await.unwrap();
    assert!(stubs.load_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn proxy_recordings_are_dropped_but_surviving_stubs_stay() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path());
    let stubs = repo.stubs_for(4545);

    stubs
        .add(stub(
            json!({"equals": {"path": "/"}}),
            vec![
                json!({"is": {"body": "x"}}),
                json!({"is": {"_proxyResponseTime": 5, "body": "y"}}),
            ],
        ))
        .await
        .unwrap();
    stubs
        .add(stub(
            json!({"equals": {"path": "/recorded"}}),
            vec![json!({"is": {"_proxyResponseTime": 9, "body": "z"}})],
        ))
        .await
        .unwrap();

    stubs.delete_saved_proxy_responses().await.unwrap();

    let listed = stubs.to_json().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].responses, vec![json!({"is": {"body": "x"}})]);
}

#[tokio::test]
async fn imposter_lifecycle_add_get_all_del() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path());
    let stopped = Arc::new(AtomicUsize::new(0));

    for port in [4545u16, 5555] {
        let stopped = Arc::clone(&stopped);
        repo.add(
            port,
            imposter_value(port),
            Box::new(move || {
                stopped.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
        repo.stubs_for(port)
            .add(stub(json!({"equals": {"path": "/"}}), vec![json!({"is": {"body": "hi"}})]))
            .await
            .unwrap();
    }

    assert!(repo.exists(4545));
    assert!(!repo.exists(4546));

    let all = repo.all().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0]["port"], json!(4545));
    assert_eq!(all[0]["stubs"][0]["responses"][0]["is"]["body"], json!("hi"));

    let deleted = repo.del(4545).await.unwrap().unwrap();
    assert_eq!(deleted["port"], json!(4545));
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
    assert!(!dir.path().join("4545").exists());
    assert_eq!(repo.all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn delete_all_stops_everything_and_clears_the_datadir() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path().join("data"));
    let stopped = Arc::new(AtomicUsize::new(0));

    for port in [4545u16, 5555] {
        let stopped = Arc::clone(&stopped);
        repo.add(
            port,
            imposter_value(port),
            Box::new(move || {
                stopped.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
    }

    repo.delete_all().await.unwrap();
    assert_eq!(stopped.load(Ordering::SeqCst), 2);
    assert!(!dir.path().join("data").exists());
    assert!(repo.all().await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_all_sync_matches_the_async_variant() {
    let dir = TempDir::new().unwrap();
    let repo = ImposterRepository::new(dir.path().join("data"));
    let stopped = Arc::new(AtomicUsize::new(0));

    let hook = {
        let stopped = Arc::clone(&stopped);
        Box::new(move || {
            stopped.fetch_add(1, Ordering::SeqCst);
        })
    };
    repo.add(4545, imposter_value(4545), hook).await.unwrap();

    repo.delete_all_sync().unwrap();
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
    assert!(!dir.path().join("data").exists());
    assert!(!repo.exists(4545));
}
