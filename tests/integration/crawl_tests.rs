//! Integration tests for the crawler
//!
//! These tests use wiremock to stand in for the GitHub GraphQL endpoint and
//! run the full crawl cycle end-to-end against an on-disk SQLite database.

use serde_json::{json, Value};
use starling::config::{parse_config, Config};
use starling::crawler::crawl;
use starling::output::export_csv;
use starling::state::PartitionState;
use starling::storage::{CheckpointStore, RunStatus, SqliteStorage};
use std::path::Path;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration pointing at the mock server
fn create_test_config(server: &MockServer, db_path: &Path, extra: &str) -> Config {
    let toml = format!(
        r#"
[github]
api-url = "{}/graphql"
token = "ghp_integration"
page-size = 2

[crawl]
batch-size = 2
max-concurrent-partitions = 2

[retry]
max-attempts = 3
base-delay-ms = 1
max-delay-ms = 5
jitter = false
flush-base-delay-ms = 1
flush-max-delay-ms = 5

[output]
database-path = "{}"
{}
"#,
        server.uri(),
        db_path.display(),
        extra
    );

    parse_config(&toml, |_| None).expect("test config should be valid")
}

fn repo(id: &str, owner: &str, stars: u64) -> Value {
    json!({ "id": id, "name": format!("{}-repo", owner), "owner": { "login": owner }, "stargazerCount": stars })
}

/// A search page; `next` is the end cursor when more pages follow
fn page(nodes: Vec<Value>, next: Option<&str>) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "data": {
            "search": {
                "pageInfo": { "hasNextPage": next.is_some(), "endCursor": next },
                "nodes": nodes
            },
            "rateLimit": { "remaining": 4999, "resetAt": "2099-01-01T00:00:00Z" }
        }
    }))
}

fn cursor_is(cursor: Option<&str>) -> impl wiremock::Match {
    body_partial_json(json!({ "variables": { "cursor": cursor } }))
}

#[tokio::test]
async fn test_full_crawl_single_partition() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("crawl.db");

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("authorization", "Bearer ghp_integration"))
        .and(cursor_is(None))
        .respond_with(page(
            vec![repo("R_1", "alice", 900), repo("R_2", "bob", 800)],
            Some("c1"),
        ))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(cursor_is(Some("c1")))
        .respond_with(page(
            vec![repo("R_3", "carol", 700), Value::Null],
            None,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let config = create_test_config(&server, &db_path, "");
    let summary = crawl(config, "hash-1", false, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.run_status(), RunStatus::Completed);
    assert_eq!(summary.pages_fetched(), 2);
    assert_eq!(summary.records_written(), 3);

    let storage = SqliteStorage::new(&db_path).unwrap();
    assert_eq!(storage.count_repositories().unwrap(), 3);

    let carol = storage.get_repository("R_3").unwrap().unwrap();
    assert_eq!(carol.owner, "carol");
    assert_eq!(carol.stargazer_count, 700);

    let checkpoint = storage.load_checkpoint("all").unwrap().unwrap();
    assert_eq!(checkpoint.state, PartitionState::Done);
    assert_eq!(checkpoint.pages_fetched, 2);

    let run = storage.get_latest_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.config_hash, "hash-1");
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn test_resume_after_failure_skips_durable_pages() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("crawl.db");

    Mock::given(method("POST"))
        .and(cursor_is(None))
        .respond_with(page(
            vec![repo("R_1", "alice", 900), repo("R_2", "bob", 800)],
            Some("c1"),
        ))
        .expect(1)
        .mount(&server)
        .await;

    // The first run is refused on the second page, the next one gets through
    Mock::given(method("POST"))
        .and(cursor_is(Some("c1")))
        .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(cursor_is(Some("c1")))
        .respond_with(page(vec![repo("R_3", "carol", 700)], None))
        .expect(1)
        .mount(&server)
        .await;

    let first = crawl(
        create_test_config(&server, &db_path, ""),
        "hash-1",
        false,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(first.run_status(), RunStatus::Failed);
    assert_eq!(first.failures().count(), 1);
    assert_eq!(first.records_written(), 2);

    {
        let storage = SqliteStorage::new(&db_path).unwrap();
        let checkpoint = storage.load_checkpoint("all").unwrap().unwrap();
        assert_eq!(checkpoint.state, PartitionState::Failed);
        assert_eq!(checkpoint.cursor.as_ref().map(|c| c.as_str()), Some("c1"));
        assert!(checkpoint.last_error.is_some());
    }

    let second = crawl(
        create_test_config(&server, &db_path, ""),
        "hash-1",
        false,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(second.run_status(), RunStatus::Completed);
    assert_eq!(second.pages_fetched(), 1);

    let storage = SqliteStorage::new(&db_path).unwrap();
    assert_eq!(storage.count_repositories().unwrap(), 3);
    assert_eq!(
        storage.load_checkpoint("all").unwrap().unwrap().state,
        PartitionState::Done
    );
}

#[tokio::test]
async fn test_transient_errors_are_absorbed() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("crawl.db");

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .respond_with(page(vec![repo("R_1", "alice", 10)], None))
        .expect(1)
        .mount(&server)
        .await;

    let summary = crawl(
        create_test_config(&server, &db_path, ""),
        "hash-1",
        false,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.run_status(), RunStatus::Completed);
    assert_eq!(summary.records_written(), 1);
}

#[tokio::test]
async fn test_partitions_are_crawled_independently() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("crawl.db");

    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "variables": { "searchQuery": "is:public stars:0..99 sort:stars-desc" }
        })))
        .respond_with(page(vec![repo("R_low", "lena", 42)], None))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "variables": { "searchQuery": "is:public stars:>=100 sort:stars-desc" }
        })))
        .respond_with(page(vec![repo("R_high", "hugo", 4200)], None))
        .expect(1)
        .mount(&server)
        .await;

    let partitions = r#"
[[partition]]
id = "low"
min-stars = 0
max-stars = 99

[[partition]]
id = "high"
min-stars = 100
"#;

    let summary = crawl(
        create_test_config(&server, &db_path, partitions),
        "hash-2",
        false,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.run_status(), RunStatus::Completed);
    let ids: Vec<&str> = summary
        .reports
        .iter()
        .map(|r| r.partition_id.as_str())
        .collect();
    assert_eq!(ids, vec!["low", "high"]);

    let storage = SqliteStorage::new(&db_path).unwrap();
    assert_eq!(storage.count_repositories().unwrap(), 2);
    assert_eq!(storage.list_checkpoints().unwrap().len(), 2);
}

#[tokio::test]
async fn test_completed_partitions_rerun_only_when_fresh() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("crawl.db");

    Mock::given(method("POST"))
        .respond_with(page(vec![repo("R_1", "alice", 10)], None))
        .expect(2)
        .mount(&server)
        .await;

    for fresh in [false, false, true] {
        let summary = crawl(
            create_test_config(&server, &db_path, ""),
            "hash-1",
            fresh,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(summary.run_status(), RunStatus::Completed);
    }

    let storage = SqliteStorage::new(&db_path).unwrap();
    assert_eq!(storage.count_repositories().unwrap(), 1);
}

#[tokio::test]
async fn test_page_budget_stops_and_resumes() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("crawl.db");

    Mock::given(method("POST"))
        .and(cursor_is(None))
        .respond_with(page(vec![repo("R_1", "alice", 90), repo("R_2", "bob", 80)], Some("c1")))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(cursor_is(Some("c1")))
        .respond_with(page(vec![repo("R_3", "carol", 70)], None))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = create_test_config(&server, &db_path, "");
    config.crawl.max_pages = Some(1);

    let first = crawl(config.clone(), "hash-1", false, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.reports[0].state, PartitionState::BudgetReached);
    assert_eq!(first.run_status(), RunStatus::Completed);

    let second = crawl(config, "hash-1", false, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.reports[0].state, PartitionState::Done);

    let storage = SqliteStorage::new(&db_path).unwrap();
    assert_eq!(storage.count_repositories().unwrap(), 3);
}

#[tokio::test]
async fn test_cancelled_crawl_is_interrupted() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("crawl.db");

    Mock::given(method("POST"))
        .respond_with(page(vec![repo("R_1", "alice", 10)], None))
        .expect(0)
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = crawl(
        create_test_config(&server, &db_path, ""),
        "hash-1",
        false,
        cancel,
    )
    .await
    .unwrap();

    assert_eq!(summary.run_status(), RunStatus::Interrupted);
    assert_eq!(summary.reports[0].state, PartitionState::Cancelled);

    let storage = SqliteStorage::new(&db_path).unwrap();
    assert_eq!(
        storage.get_latest_run().unwrap().unwrap().status,
        RunStatus::Interrupted
    );
}

#[tokio::test]
async fn test_export_after_crawl() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("crawl.db");
    let csv_path = dir.path().join("repos.csv");

    Mock::given(method("POST"))
        .respond_with(page(
            vec![repo("R_small", "sam", 3), repo("R_big", "bea", 3000)],
            None,
        ))
        .mount(&server)
        .await;

    crawl(
        create_test_config(&server, &db_path, ""),
        "hash-1",
        false,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let storage = SqliteStorage::new(&db_path).unwrap();
    assert_eq!(export_csv(&storage, &csv_path).unwrap(), 2);

    let mut reader = csv::Reader::from_path(&csv_path).unwrap();
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(&rows[0][0], "R_big");
    assert_eq!(&rows[0][1], "bea");
    assert_eq!(&rows[0][3], "3000");
    assert_eq!(&rows[1][0], "R_small");
}
