use anyhow::Result;
use axum::http::StatusCode;

mod common;

#[tokio::test]
async fn health_endpoint_reports_db_ok() -> Result<()> {
    let app = common::spawn_app().await?;

    let (status, body) = app.send("GET", "/api/health", None, None).await?;
    assert_eq!(status, StatusCode::OK, "health endpoint did not return 200");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["dbOk"], true, "expected dbOk: true, got: {}", body);

    Ok(())
}
