use std::sync::Arc;
use std::time::Duration;

use batchforge_api::app::{AppServices, build_app};
use batchforge_infra::BatchConfig;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};

const CSV: &str = "ISBN,TITLE,AUTHORS,YEAR_PUBLISHED\n\
9780134685991,Effective Java,Joshua Bloch,2018\n\
9780201633610,Design Patterns,\"Gamma, Helm, Johnson, Vlissides\",1994\n\
9781593278281,The Rust Programming Language,Klabnik and Nichols,\n";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    _uploads: tempfile::TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let uploads = tempfile::tempdir().expect("failed to create upload dir");
        let config = BatchConfig {
            upload_dir: uploads.path().to_path_buf(),
            ..BatchConfig::default()
        };
        let services = Arc::new(AppServices::in_memory(&config).expect("failed to build services"));

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            _uploads: uploads,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn upload_form(csv: &str) -> Form {
    Form::new().part(
        "file",
        Part::bytes(csv.as_bytes().to_vec())
            .file_name("books.csv")
            .mime_str("text/csv")
            .unwrap(),
    )
}

async fn start_import(client: &reqwest::Client, base_url: &str, cid: &str, csv: &str) -> reqwest::Response {
    client
        .post(format!("{}/api/v1/books/import/start", base_url))
        .header("X-Correlation-ID", cid)
        .multipart(upload_form(csv))
        .send()
        .await
        .unwrap()
}

async fn status_eventually(client: &reqwest::Client, base_url: &str, cid: &str, want: &str) -> serde_json::Value {
    // Imports run on a background thread; poll until the execution settles.
    for _ in 0..200 {
        let res = client
            .get(format!("{}/api/v1/books/import/status/{}", base_url, cid))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = res.json().await.unwrap();
        if body["status"] == want {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("import {cid} did not reach {want} within timeout");
}

#[tokio::test]
async fn health_reports_up() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "UP");
}

#[tokio::test]
async fn import_lifecycle_start_poll_list() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = start_import(&client, &srv.base_url, "lifecycle-1", CSV).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    assert_eq!(res.headers()["X-Correlation-ID"], "lifecycle-1");
    let started: serde_json::Value = res.json().await.unwrap();
    assert_eq!(started["correlation_id"], "lifecycle-1");
    assert!(started["execution_id"].as_u64().is_some());
    assert!(started["create_time"].is_string());

    let done = status_eventually(&client, &srv.base_url, "lifecycle-1", "COMPLETED").await;
    assert_eq!(done["execution_id"], started["execution_id"]);
    assert_eq!(done["job_id"], started["job_id"]);
    assert!(done["end_time"].is_string());

    let res = client
        .get(format!("{}/api/v1/books", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let books: Vec<serde_json::Value> = res.json().await.unwrap();
    assert_eq!(books.len(), 3);
    assert_eq!(books[1]["authors"], "Gamma, Helm, Johnson, Vlissides");
    assert!(books[2]["year_published"].is_null());

    let res = client
        .get(format!(
            "{}/api/v1/books/import/executions/{}",
            srv.base_url, started["execution_id"]
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let by_id: serde_json::Value = res.json().await.unwrap();
    assert_eq!(by_id["correlation_id"], "lifecycle-1");
    assert_eq!(by_id["status"], "COMPLETED");
}

#[tokio::test]
async fn completed_correlation_id_cannot_be_reused() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = start_import(&client, &srv.base_url, "once", CSV).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    status_eventually(&client, &srv.base_url, "once", "COMPLETED").await;

    let res = start_import(&client, &srv.base_url, "once", CSV).await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "instance_already_complete");
}

#[tokio::test]
async fn failed_import_can_be_restarted_with_a_fixed_file() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let broken = "ISBN,TITLE,AUTHORS,YEAR_PUBLISHED\n97801346859910000,Too Long,Someone,2000\n";
    let res = start_import(&client, &srv.base_url, "retry", broken).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let failed = status_eventually(&client, &srv.base_url, "retry", "FAILED").await;
    assert!(failed["exit_status"].as_str().unwrap().contains("longer than 13"));

    let res = start_import(&client, &srv.base_url, "retry", CSV).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let restarted: serde_json::Value = res.json().await.unwrap();
    assert_eq!(restarted["job_id"], failed["job_id"]);
    assert_ne!(restarted["execution_id"], failed["execution_id"]);
    status_eventually(&client, &srv.base_url, "retry", "COMPLETED").await;
}

#[tokio::test]
async fn correlation_id_is_generated_when_missing() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/api/v1/books/import/start", srv.base_url))
        .multipart(upload_form(CSV))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let header = res.headers()["X-Correlation-ID"].to_str().unwrap().to_string();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["correlation_id"], header.as_str());
    assert!(uuid::Uuid::parse_str(&header).is_ok());
}

#[tokio::test]
async fn missing_file_field_is_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/api/v1/books/import/start", srv.base_url))
        .multipart(Form::new().text("note", "no file here"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_upload");
}

#[tokio::test]
async fn unknown_lookups_are_not_found_or_bad_request() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/api/v1/books/import/status/nobody", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("nobody"));

    let res = client
        .get(format!("{}/api/v1/books/import/executions/999", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(format!("{}/api/v1/books/import/executions/abc", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}
