//! Control-plane surface tests: Connection lifecycle, CSV upload and query,
//! error-code mapping, and authentication.

mod common;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use common::spawn_gateway;
use serde_json::json;

#[tokio::test]
async fn requests_without_a_token_are_unauthorized() {
    let gw = spawn_gateway().await;
    let response = gw
        .http
        .get(gw.url("/api/v1/connections"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn connection_lifecycle_over_http() {
    let gw = spawn_gateway().await;
    let token = gw.login("alice");

    let created = gw.create_connection(&token, "warehouse").await;
    assert!(!created["agent_key"].as_str().unwrap().is_empty());
    let connection_id = created["connection_id"].as_str().unwrap();

    // The key is never shown again: list and get carry no key material.
    let listed: serde_json::Value = gw
        .http
        .get(gw.url("/api/v1/connections"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert!(listed[0].get("agent_key").is_none());
    assert_eq!(listed[0]["connected"], false);

    let fetched: serde_json::Value = gw
        .http
        .get(gw.url(&format!("/api/v1/connections/{connection_id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["name"], "warehouse");
    assert_eq!(fetched["db_type"], "postgres");

    let deleted = gw
        .http
        .delete(gw.url(&format!("/api/v1/connections/{connection_id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), reqwest::StatusCode::NO_CONTENT);

    let gone = gw
        .http
        .get(gw.url(&format!("/api/v1/connections/{connection_id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn foreign_connections_are_invisible() {
    let gw = spawn_gateway().await;
    let alice = gw.login("alice");
    let bob = gw.login("bob");

    let created = gw.create_connection(&bob, "bobs-db").await;
    let connection_id = created["connection_id"].as_str().unwrap();

    let response = gw
        .http
        .get(gw.url(&format!("/api/v1/connections/{connection_id}")))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn query_with_no_data_source_is_a_bad_request() {
    let gw = spawn_gateway().await;
    let token = gw.login("alice");
    let response = gw
        .http
        .post(gw.url("/api/v1/query"))
        .bearer_auth(&token)
        .json(&json!({"question": "anything"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "no_data_source");
}

#[tokio::test]
async fn schema_refresh_for_an_offline_agent_maps_to_bad_gateway() {
    let gw = spawn_gateway().await;
    let token = gw.login("alice");
    let created = gw.create_connection(&token, "warehouse").await;
    let connection_id = created["connection_id"].as_str().unwrap();

    let response = gw
        .http
        .post(gw.url(&format!(
            "/api/v1/connections/{connection_id}/schema/refresh"
        )))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "agent_unreachable");
}

async fn upload_csv(gw: &common::TestGateway, token: &str, content: &str) -> serde_json::Value {
    let response = gw
        .http
        .post(gw.url("/api/v1/files"))
        .bearer_auth(token)
        .json(&json!({
            "filename": "data.csv",
            "content_base64": STANDARD.encode(content),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    response.json().await.unwrap()
}

#[tokio::test]
async fn csv_sql_cold_path_over_http() {
    let gw = spawn_gateway().await;
    let token = gw.login("alice");
    let uploaded = upload_csv(&gw, &token, "status,amount\nopen,10\nclosed,5\nopen,1\n").await;
    let file_id = uploaded["file_id"].as_str().unwrap();

    // The bound table name is deterministic: csv_ + sanitized file id.
    let table = format!("csv_{}", file_id.replace('-', "_"));
    gw.llm
        .push_reply(format!("SELECT COUNT(*) AS count FROM {table} WHERE status = 'open'"));
    gw.llm.push_reply("There are 2 open rows.");

    let response = gw
        .http
        .post(gw.url("/api/v1/query"))
        .bearer_auth(&token)
        .json(&json!({
            "file_id": file_id,
            "question": "count rows where status is open",
            "user_preference": "sql",
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["row_count"], 1);
    assert_eq!(body["columns"], json!(["count"]));
    assert_eq!(body["rows"][0][0], 2);
    assert_eq!(body["answer"], "There are 2 open rows.");

    // The pool now holds the session.
    assert_eq!(gw.ctx.csv_pool.session_count(), 1);
}

#[tokio::test]
async fn unsafe_generated_sql_is_rejected_with_the_stable_code() {
    let gw = spawn_gateway().await;
    let token = gw.login("alice");
    let uploaded = upload_csv(&gw, &token, "a\n1\n").await;
    let file_id = uploaded["file_id"].as_str().unwrap();

    gw.llm.push_reply("DROP TABLE employees; SELECT 1");
    let response = gw
        .http
        .post(gw.url("/api/v1/query"))
        .bearer_auth(&token)
        .json(&json!({
            "file_id": file_id,
            "question": "destroy everything",
            "user_preference": "sql",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "unsafe_query");
}

#[tokio::test]
async fn oversized_uploads_are_rejected_with_too_large() {
    let gw = spawn_gateway().await;
    let token = gw.login("alice");
    // Testing cap is 64 KiB; build a payload one byte over.
    let cap = gw.ctx.config.csv_source_cap.as_u64() as usize;
    let content = "x".repeat(cap + 1);

    let response = gw
        .http
        .post(gw.url("/api/v1/files"))
        .bearer_auth(&token)
        .json(&json!({
            "filename": "big.csv",
            "content_base64": STANDARD.encode(&content),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PAYLOAD_TOO_LARGE);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "too_large");
}

#[tokio::test]
async fn file_lifecycle_and_logout_release_csv_sessions() {
    let gw = spawn_gateway().await;
    let token = gw.login("alice");
    let uploaded = upload_csv(&gw, &token, "a\n1\n").await;
    let file_id = uploaded["file_id"].as_str().unwrap();

    let url_response: serde_json::Value = gw
        .http
        .get(gw.url(&format!("/api/v1/files/{file_id}/url")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!url_response["url"].as_str().unwrap().is_empty());

    // Materialize a session, then log out: the session must be released.
    gw.llm.push_reply(format!(
        "SELECT COUNT(*) AS count FROM csv_{}",
        file_id.replace('-', "_")
    ));
    gw.llm.push_reply("One row.");
    gw.http
        .post(gw.url("/api/v1/query"))
        .bearer_auth(&token)
        .json(&json!({
            "file_id": file_id,
            "question": "how many rows",
            "user_preference": "sql",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(gw.ctx.csv_pool.session_count(), 1);

    let logout = gw
        .http
        .post(gw.url("/api/v1/logout"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(logout.status(), reqwest::StatusCode::NO_CONTENT);
    assert_eq!(gw.ctx.csv_pool.session_count(), 0);

    let deleted = gw
        .http
        .delete(gw.url(&format!("/api/v1/files/{file_id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), reqwest::StatusCode::NO_CONTENT);

    let listed: serde_json::Value = gw
        .http
        .get(gw.url("/api/v1/files"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.as_array().unwrap().is_empty());
}
