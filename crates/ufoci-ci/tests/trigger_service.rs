//! HTTP-level tests of the trigger service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ufoci_ci::TriggerService;
use ufoci_core::hooks::HookRegistry;
use ufoci_core::{BuildLock, Config};

async fn spawn_service(config: Config) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = TriggerService::new(config, Arc::new(HookRegistry::new())).router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_push_status_codes() {
    let home = tempfile::tempdir().unwrap();
    let config = Config::default().with_home(home.path());
    let lock = BuildLock::new(config.lock_path());
    let addr = spawn_service(config).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/push");

    let response = client.post(&url).body("not json").send().await.unwrap();
    assert_eq!(response.status().as_u16(), 400);

    lock.acquire().unwrap();
    let response = client
        .post(&url)
        .json(&serde_json::json!({"repository_url": "u", "branch": "b"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 423);
    assert_eq!(response.text().await.unwrap(), "build in progress");
    lock.release().unwrap();

    // accepted; the build itself fails at clone and releases the lock
    let missing = home.path().join("no-such-repo");
    let response = client
        .post(&url)
        .json(&serde_json::json!({
            "repository_url": missing.to_string_lossy(),
            "branch": "main",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "build accepted");

    for _ in 0..50 {
        if !lock.is_locked() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!lock.is_locked());
}

#[tokio::test]
async fn test_archive_and_status_routes() {
    let home = tempfile::tempdir().unwrap();
    let config = Config::default().with_home(home.path());
    let build = config.builds_path().join("ufo-target__2024_05_01__12_00_00");
    std::fs::create_dir_all(&build).unwrap();
    std::fs::write(build.join("build.json"), r#"{"ok": true}"#).unwrap();
    let addr = spawn_service(config).await;

    let body = reqwest::get(format!("http://{addr}/archive/ufo-target__2024_05_01__12_00_00/build.json"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, r#"{"ok": true}"#);

    let missing = reqwest::get(format!("http://{addr}/archive/nothing/here.json"))
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);

    let status = reqwest::get(format!("http://{addr}/")).await.unwrap().text().await.unwrap();
    assert!(status.contains("idle"));
}
