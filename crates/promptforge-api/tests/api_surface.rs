//! Validation, listing, logs, health, and queue behavior of the HTTP
//! surface.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{grid_payload, run_payload, spawn_app};

#[tokio::test]
async fn health_reports_ok_with_registered_assets() {
    let app = spawn_app().await;
    let (status, body) = app.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], json!("ok"));
    let modules = body["registered_assets"]["modules"].as_array().unwrap();
    assert!(modules.iter().any(|m| m == "predict"));
}

#[tokio::test]
async fn health_fails_when_pool_stopped() {
    let app = spawn_app().await;
    app.pool.stop(Duration::from_secs(2)).await;

    let (status, body) = app.get("/health").await;
    assert_eq!(status, 503);
    assert_eq!(body["error"], json!("service_unavailable"));
}

#[tokio::test]
async fn queue_endpoint_reports_worker_state() {
    let app = spawn_app().await;
    let (status, body) = app.get("/queue").await;
    assert_eq!(status, 200);
    assert_eq!(body["pending_jobs"], json!(0));
    assert_eq!(body["active_jobs"], json!(0));
    assert_eq!(body["worker_threads"], json!(2));
    assert_eq!(body["workers_alive"], json!(true));
}

#[tokio::test]
async fn schema_errors_return_422_with_field_paths() {
    let app = spawn_app().await;

    // Empty dataset: constraint violation with a precise field.
    let mut payload = run_payload("alice");
    payload["dataset"] = json!([]);
    let (status, body) = app.post_json("/run", &payload).await;
    assert_eq!(status, 422, "{body}");
    assert_eq!(body["error"], json!("invalid_request"));
    let issues = body["detail"].as_array().unwrap();
    assert!(issues.iter().any(|issue| issue["field"] == json!("dataset")
        && issue["message"]
            .as_str()
            .unwrap()
            .contains("at least one row")));

    // Overlapping column mapping.
    let mut payload = run_payload("alice");
    payload["column_mapping"] = json!({
        "inputs": {"question": "q"},
        "outputs": {"answer": "q"}
    });
    let (status, body) = app.post_json("/run", &payload).await;
    assert_eq!(status, 422);
    let issues = body["detail"].as_array().unwrap();
    assert!(issues
        .iter()
        .any(|issue| issue["field"] == json!("column_mapping")));

    // Bad split fractions.
    let mut payload = run_payload("alice");
    payload["split_fractions"] = json!({"train": 0.9, "val": 0.3, "test": 0.3});
    let (status, body) = app.post_json("/run", &payload).await;
    assert_eq!(status, 422);
    let issues = body["detail"].as_array().unwrap();
    assert!(issues
        .iter()
        .any(|issue| issue["message"].as_str().unwrap().contains("sum to 1.0")));

    // Missing required field: structural failure, single body issue.
    let mut payload = run_payload("alice");
    payload.as_object_mut().unwrap().remove("username");
    let (status, body) = app.post_json("/run", &payload).await;
    assert_eq!(status, 422);
    let issues = body["detail"].as_array().unwrap();
    assert!(issues[0]["message"].as_str().unwrap().contains("username"));
}

#[tokio::test]
async fn semantic_validation_failures_return_400() {
    let app = spawn_app().await;

    let mut payload = run_payload("alice");
    payload["module_name"] = json!("imaginary_module");
    let (status, body) = app.post_json("/run", &payload).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], json!("validation_error"));
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .contains("imaginary_module"));
}

#[tokio::test]
async fn grid_schema_requires_model_lists() {
    let app = spawn_app().await;

    let mut payload = grid_payload("alice", false);
    payload["generation_models"] = json!([]);
    let (status, body) = app.post_json("/grid-search", &payload).await;
    assert_eq!(status, 422);
    let issues = body["detail"].as_array().unwrap();
    assert!(issues.iter().any(|issue| issue["message"]
        .as_str()
        .unwrap()
        .contains("generation model")));
}

#[tokio::test]
async fn listing_rejects_unknown_filter_values() {
    let app = spawn_app().await;

    let (status, body) = app.get("/jobs?status=exploded").await;
    assert_eq!(status, 422);
    assert_eq!(body["error"], json!("invalid_request"));
    let issues = body["detail"].as_array().unwrap();
    assert_eq!(issues[0]["field"], json!("status"));

    let (status, body) = app.get("/jobs?job_type=batch").await;
    assert_eq!(status, 422);
    let issues = body["detail"].as_array().unwrap();
    assert_eq!(issues[0]["field"], json!("job_type"));

    let (status, _) = app.get("/jobs?limit=0").await;
    assert_eq!(status, 422);
    let (status, _) = app.get("/jobs?limit=501").await;
    assert_eq!(status, 422);
    let (status, _) = app.get("/jobs?offset=-1").await;
    assert_eq!(status, 422);
}

#[tokio::test]
async fn listing_filters_compose_and_paginate() {
    let app = spawn_app().await;

    for username in ["alice", "alice", "bob"] {
        let (status, _) = app.post_json("/run", &run_payload(username)).await;
        assert_eq!(status, 201);
    }
    let (status, _) = app
        .post_json("/grid-search", &grid_payload("alice", false))
        .await;
    assert_eq!(status, 201);

    let (status, body) = app.get("/jobs?username=alice").await;
    assert_eq!(status, 200);
    assert_eq!(body["total"], json!(3));
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    for item in items {
        assert_eq!(item["username"], json!("alice"));
        assert!(item.get("progress_count").is_some());
        assert!(item.get("log_count").is_some());
    }

    let (status, body) = app.get("/jobs?username=alice&job_type=grid_search").await;
    assert_eq!(status, 200);
    assert_eq!(body["total"], json!(1));
    assert_eq!(body["items"][0]["job_type"], json!("grid_search"));

    let (status, body) = app.get("/jobs?limit=2&offset=0").await;
    assert_eq!(status, 200);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert_eq!(body["total"], json!(4));
    assert_eq!(body["limit"], json!(2));

    let (status, body) = app.get("/jobs?limit=2&offset=100").await;
    assert_eq!(status, 200);
    assert!(body["items"].as_array().unwrap().is_empty());

    // Newest first.
    let (_, body) = app.get("/jobs").await;
    let items = body["items"].as_array().unwrap();
    let created: Vec<&str> = items
        .iter()
        .map(|item| item["created_at"].as_str().unwrap())
        .collect();
    let mut sorted = created.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(created, sorted);
}

#[tokio::test]
async fn logs_endpoint_filters_and_paginates() {
    let app = spawn_app().await;

    let job_id = "logged-job";
    app.store.create_job(job_id).await.unwrap();
    for i in 0..5 {
        app.store
            .append_log(job_id, "INFO", "optimizer", &format!("info {i}"), None)
            .await
            .unwrap();
    }
    app.store
        .append_log(job_id, "ERROR", "optimizer", "bad thing", None)
        .await
        .unwrap();

    let (status, body) = app.get(&format!("/jobs/{job_id}/logs")).await;
    assert_eq!(status, 200);
    assert_eq!(body["total"], json!(6));
    assert_eq!(body["items"].as_array().unwrap().len(), 6);

    // Case-insensitive level match, count consistent with items.
    let (status, body) = app.get(&format!("/jobs/{job_id}/logs?level=error")).await;
    assert_eq!(status, 200);
    assert_eq!(body["total"], json!(1));
    assert_eq!(body["items"][0]["message"], json!("bad thing"));

    let (status, body) = app
        .get(&format!("/jobs/{job_id}/logs?limit=2&offset=1"))
        .await;
    assert_eq!(status, 200);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["message"], json!("info 1"));

    // Offset past the end returns an empty page, not an error.
    let (status, body) = app
        .get(&format!("/jobs/{job_id}/logs?limit=10&offset=50"))
        .await;
    assert_eq!(status, 200);
    assert!(body["items"].as_array().unwrap().is_empty());

    // Unknown jobs are 404.
    let (status, _) = app.get("/jobs/ghost/logs").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn unknown_job_returns_404_everywhere() {
    let app = spawn_app().await;
    for path in [
        "/jobs/ghost",
        "/jobs/ghost/summary",
        "/jobs/ghost/payload",
        "/jobs/ghost/artifact",
        "/jobs/ghost/grid-result",
    ] {
        let (status, body) = app.get(path).await;
        assert_eq!(status, 404, "{path} should 404");
        assert_eq!(body["error"], json!("not_found"), "{path}");
    }
    let (status, _) = app.post_empty("/jobs/ghost/cancel").await;
    assert_eq!(status, 404);
    let (status, _) = app.delete("/jobs/ghost").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn artifact_conflicts_while_in_flight() {
    let app = spawn_app().await;

    let mut slow = run_payload("alice");
    slow["module_kwargs"] = json!({"sleep_seconds": 3.0});
    let (_, body) = app.post_json("/run", &slow).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, body) = app.get(&format!("/jobs/{job_id}/artifact")).await;
    assert_eq!(status, 409);
    assert!(body["detail"].as_str().unwrap().contains("not finished"));

    let (_, _) = app.post_empty(&format!("/jobs/{job_id}/cancel")).await;
    assert!(
        app.wait_for_status(&job_id, "cancelled", Duration::from_secs(2))
            .await
    );
    let (status, body) = app.get(&format!("/jobs/{job_id}/artifact")).await;
    assert_eq!(status, 409);
    assert!(body["detail"].as_str().unwrap().contains("cancelled"));
}

#[tokio::test]
async fn grid_result_not_applicable_to_run_jobs() {
    let app = spawn_app().await;

    let (_, body) = app.post_json("/run", &run_payload("alice")).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert!(
        app.wait_for_status(&job_id, "success", Duration::from_secs(10))
            .await
    );

    let (status, body) = app.get(&format!("/jobs/{job_id}/grid-result")).await;
    assert_eq!(status, 404);
    assert!(body["detail"].as_str().unwrap().contains("artifact"));
}

#[tokio::test]
async fn malformed_json_body_returns_422_shape() {
    let app = spawn_app().await;
    let response = app
        .client
        .post(format!("{}/run", app.base_url))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 422);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], json!("invalid_request"));
}

#[tokio::test]
async fn orphaned_jobs_recovered_on_startup() {
    let app = spawn_app().await;

    // Rows left mid-flight by a dead process.
    app.store.create_job("orphan-running").await.unwrap();
    app.store
        .update_job(
            "orphan-running",
            promptforge_core::JobUpdate::new().status(promptforge_core::JobStatus::Running),
        )
        .await
        .unwrap();

    let recovered = app.store.recover_orphaned_jobs().await.unwrap();
    assert_eq!(recovered, 1);

    let (status, body) = app.get("/jobs/orphan-running").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], json!("failed"));
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("interrupted by service restart"));
}
