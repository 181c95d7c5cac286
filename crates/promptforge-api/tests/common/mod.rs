//! Shared harness for API integration tests: a real listener, a scratch
//! SQLite store, the demo executor, and the in-process runner.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tempfile::TempDir;

use promptforge_api::{create_router, AppState};
use promptforge_core::repository::SqliteJobStore;
use promptforge_core::runner::LocalRunner;
use promptforge_core::{DemoExecutor, JobStore, WorkerPool, WorkerSettings};

pub struct TestApp {
    pub base_url: String,
    pub client: Client,
    pub store: Arc<dyn JobStore>,
    pub pool: Arc<WorkerPool>,
    _dir: TempDir,
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with_concurrency(2).await
}

pub async fn spawn_app_with_concurrency(concurrency: usize) -> TestApp {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::connect(path.to_str().unwrap())
            .await
            .unwrap(),
    );

    let executor = Arc::new(DemoExecutor::new());
    let runner = Arc::new(LocalRunner::new(executor.clone(), Duration::from_millis(20)));
    let pool = Arc::new(WorkerPool::new(
        store.clone(),
        executor.clone(),
        runner,
        WorkerSettings {
            concurrency,
            poll_interval: Duration::from_millis(20),
        },
    ));
    pool.start();

    let state = AppState::new(
        store.clone(),
        pool.clone(),
        executor,
        Duration::from_secs(600),
    );
    serve(state, store, pool, dir).await
}

pub async fn serve(
    state: AppState,
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    dir: TempDir,
) -> TestApp {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        client: Client::new(),
        store,
        pool,
        _dir: dir,
    }
}

impl TestApp {
    pub async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn post_empty(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn delete(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .delete(format!("{}{path}", self.base_url))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    /// Poll the summary endpoint until the job reaches `expected`.
    pub async fn wait_for_status(&self, job_id: &str, expected: &str, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            let (status, body) = self.get(&format!("/jobs/{job_id}/summary")).await;
            if status == 200 && body["status"] == json!(expected) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

/// A minimal valid /run payload against the demo executor.
pub fn run_payload(username: &str) -> Value {
    json!({
        "username": username,
        "module_name": "predict",
        "signature_code": "question -> answer",
        "metric_code": "def metric(example, pred):\n    return 1.0\n",
        "optimizer_name": "bootstrap_few_shot",
        "dataset": [{"q": "what is up", "a": "the sky"}],
        "column_mapping": {
            "inputs": {"question": "q"},
            "outputs": {"answer": "a"}
        },
        "split_fractions": {"train": 1.0, "val": 0.0, "test": 0.0},
        "shuffle": true,
        "seed": 42,
        "model_config": {"name": "openai/gpt-4o-mini"}
    })
}

/// A /grid-search payload; `fail_all` forces every pair to fail.
pub fn grid_payload(username: &str, fail_all: bool) -> Value {
    let generation_models = if fail_all {
        json!([
            {"name": "openai/gpt-4o-mini", "extra": {"fail": true}},
            {"name": "openai/gpt-4o", "extra": {"fail": true}}
        ])
    } else {
        json!([
            {"name": "openai/gpt-4o-mini"},
            {"name": "openai/gpt-4o"}
        ])
    };
    json!({
        "username": username,
        "module_name": "predict",
        "signature_code": "question -> answer",
        "metric_code": "def metric(example, pred):\n    return 1.0\n",
        "optimizer_name": "bootstrap_few_shot",
        "dataset": [{"q": "what is up", "a": "the sky"}],
        "column_mapping": {
            "inputs": {"question": "q"},
            "outputs": {"answer": "a"}
        },
        "split_fractions": {"train": 1.0, "val": 0.0, "test": 0.0},
        "generation_models": generation_models,
        "reflection_models": [{"name": "openai/gpt-4o"}]
    })
}
