//! End-to-end tests of the update server and client over HTTP
//!
//! Every test runs a real server on an ephemeral local port.

use flate2::read::GzDecoder;
use rstest::rstest;
use std::io::Read;
use std::sync::Arc;
use tempfile::TempDir;
use treesync_config::{ConfigLoader, CLIENT_STATE_FILE};
use treesync_network::{encode_request, UpdateClient, UpdateOutcome};
use treesync_sync::NoopHide;
use treesync_tests::test_utils::{sample_tree, tree_hashes, write_file, write_tree, TestServer};
use treesync_types::{
    DiffEntry, ErrorKind, Fingerprints, TransferMode, UpdateRequest, UpdateResponse,
};

fn client(server: &TestServer, dir: &std::path::Path, mode: TransferMode) -> UpdateClient {
    UpdateClient::new(server.client_config("game", dir, mode))
        .unwrap()
        .with_hide(Arc::new(NoopHide))
}

#[rstest]
#[case::archive(TransferMode::Archive)]
#[case::per_file(TransferMode::PerFile)]
#[tokio::test]
async fn test_update_brings_client_in_sync(#[case] mode: TransferMode) {
    let app = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    sample_tree(app.path());
    write_file(local.path(), "readme.txt", b"an older readme");
    let server = TestServer::start(&[("game", app.path())]).await;

    let outcome = client(&server, local.path(), mode).run().await.unwrap();

    assert_eq!(outcome, UpdateOutcome::Updated { files: 6 });
    assert_eq!(tree_hashes(local.path()), tree_hashes(app.path()));
    server.stop().await;
}

#[rstest]
#[case::archive(TransferMode::Archive)]
#[case::per_file(TransferMode::PerFile)]
#[tokio::test]
async fn test_second_run_is_up_to_date(#[case] mode: TransferMode) {
    let app = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    sample_tree(app.path());
    let server = TestServer::start(&[("game", app.path())]).await;
    let client = client(&server, local.path(), mode);

    client.run().await.unwrap();
    let outcome = client.run().await.unwrap();

    assert_eq!(outcome, UpdateOutcome::UpToDate);
    server.stop().await;
}

#[tokio::test]
async fn test_update_writes_state_file() {
    let app = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    write_tree(app.path(), &[("a.txt", "alpha")]);
    let server = TestServer::start(&[("game", app.path())]).await;

    let mut config = server.client_config("game", local.path(), TransferMode::Archive);
    config.ignore = vec!["*.log".to_string()];
    UpdateClient::new(config)
        .unwrap()
        .with_hide(Arc::new(NoopHide))
        .run()
        .await
        .unwrap();

    let state = ConfigLoader::load_client_state(local.path().join(CLIENT_STATE_FILE))
        .unwrap()
        .unwrap();
    assert_eq!(state.sync_host, server.host());
    assert_eq!(state.sync_app, "game");
    assert_eq!(state.ignore, vec!["*.log".to_string()]);
    server.stop().await;
}

#[tokio::test]
async fn test_check_only_reports_without_writing() {
    let app = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    write_tree(app.path(), &[("a.txt", "alpha"), ("b.txt", "bravo")]);
    let server = TestServer::start(&[("game", app.path())]).await;

    let mut config = server.client_config("game", local.path(), TransferMode::Archive);
    config.check_only = true;
    let outcome = UpdateClient::new(config).unwrap().run().await.unwrap();

    assert_eq!(outcome, UpdateOutcome::Available { files: 2, bytes: 10 });
    assert!(tree_hashes(local.path()).is_empty());
    assert!(!local.path().join(CLIENT_STATE_FILE).exists());
    server.stop().await;
}

#[tokio::test]
async fn test_local_ignored_files_are_kept() {
    let app = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    write_tree(app.path(), &[("game.exe", "v2"), ("settings.ini", "defaults")]);
    write_tree(local.path(), &[("game.exe", "v1"), ("settings.ini", "mine")]);
    let server = TestServer::start(&[("game", app.path())]).await;

    let mut config = server.client_config("game", local.path(), TransferMode::PerFile);
    config.ignore = vec!["settings.ini".to_string()];
    UpdateClient::new(config)
        .unwrap()
        .with_hide(Arc::new(NoopHide))
        .run()
        .await
        .unwrap();

    assert_eq!(std::fs::read(local.path().join("game.exe")).unwrap(), b"v2");
    assert_eq!(std::fs::read(local.path().join("settings.ini")).unwrap(), b"mine");
    server.stop().await;
}

#[tokio::test]
async fn test_server_ignored_files_are_not_offered() {
    let app = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    write_tree(app.path(), &[("game.exe", "v2"), ("private/key.pem", "secret")]);
    let server = TestServer::start_with(&[("game", app.path())], &["private/*"]).await;

    client(&server, local.path(), TransferMode::Archive)
        .run()
        .await
        .unwrap();

    assert!(local.path().join("game.exe").exists());
    assert!(!local.path().join("private").exists());

    let response = reqwest::get(server.url("/app/game/private/key.pem"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_app_is_up_to_date() {
    let app = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    sample_tree(app.path());
    let server = TestServer::start(&[("game", app.path())]).await;

    let client = UpdateClient::new(server.client_config("other", local.path(), TransferMode::Archive))
        .unwrap()
        .with_hide(Arc::new(NoopHide));
    assert_eq!(client.run().await.unwrap(), UpdateOutcome::UpToDate);
    server.stop().await;
}

#[tokio::test]
async fn test_has_update_wire_format() {
    let app = TempDir::new().unwrap();
    write_tree(app.path(), &[("a.txt", "alpha"), ("b.txt", "bravo")]);
    let server = TestServer::start(&[("game", app.path())]).await;

    let mut hashes = Fingerprints::new();
    hashes.insert("a.txt".to_string(), treesync_sync::hash_bytes(b"alpha"));
    let body = encode_request(&UpdateRequest::new(hashes)).unwrap();

    let http = reqwest::Client::new();
    let raw: serde_json::Value = http
        .post(server.url("/hasupdate/game"))
        .form(&[("req", body)])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let patch_file = raw["PatchFile"].as_str().unwrap();
    assert!(patch_file.starts_with("/tmpfiles/"));
    assert_eq!(raw["Diff"]["b.txt"]["OldHash"], "");
    assert_eq!(raw["Diff"]["b.txt"]["NewSize"], 5);
    assert!(raw["Diff"].get("a.txt").is_none());

    let response: UpdateResponse = serde_json::from_value(raw.clone()).unwrap();
    let archive = reqwest::get(server.url(patch_file))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(archive.len() as u64, response.patch_size);
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_request_is_bad_request() {
    let app = TempDir::new().unwrap();
    let server = TestServer::start(&[("game", app.path())]).await;

    let response = reqwest::Client::new()
        .post(server.url("/hasupdate/game"))
        .form(&[("req", "{not json")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    server.stop().await;
}

#[rstest]
#[case("/tmpfiles/0123456789abcdef0123456789abcdef.tar.gz")]
#[case("/tmpfiles/not-an-archive")]
#[case("/app/game/missing.txt")]
#[case("/app/other/a.txt")]
#[tokio::test]
async fn test_missing_downloads_are_not_found(#[case] path: &str) {
    let app = TempDir::new().unwrap();
    write_tree(app.path(), &[("a.txt", "alpha")]);
    let server = TestServer::start(&[("game", app.path())]).await;

    let response = reqwest::get(server.url(path)).await.unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    server.stop().await;
}

#[tokio::test]
async fn test_app_file_is_gzip_encoded() {
    let app = TempDir::new().unwrap();
    write_tree(app.path(), &[("docs/read me.txt", "hello there")]);
    let server = TestServer::start(&[("game", app.path())]).await;

    let response = reqwest::get(server.url("/app/game/docs/read%20me.txt"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["content-encoding"], "gzip");

    let body = response.bytes().await.unwrap();
    let mut content = String::new();
    GzDecoder::new(body.as_ref())
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "hello there");
    assert_eq!(server.coordinator.cache().len(), 1);
    server.stop().await;
}

/// Server that answers every update check with `diff` and serves `body` for any file
async fn start_rogue_server(diff: UpdateResponse, body: &'static str) -> String {
    use axum::routing::{get, post};

    let app = axum::Router::new()
        .route(
            "/hasupdate/:app",
            post(move || {
                let diff = diff.clone();
                async move { axum::Json(diff) }
            }),
        )
        .route("/app/*path", get(move || async move { body }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    addr.to_string()
}

#[rstest]
#[case::archive(TransferMode::Archive)]
#[case::per_file(TransferMode::PerFile)]
#[tokio::test]
async fn test_escaping_diff_keys_fail_without_writing(#[case] mode: TransferMode) {
    let outer = TempDir::new().unwrap();
    let local = outer.path().join("client");
    let mut response = UpdateResponse::default();
    response.diff.insert(
        "../escape.txt".to_string(),
        DiffEntry {
            new_hash: treesync_sync::hash_bytes(b"pwned"),
            old_hash: None,
            new_size: 5,
            mode: 0o644,
            mod_time: chrono::Utc::now(),
        },
    );
    let host = start_rogue_server(response, "pwned").await;

    let mut config = treesync_config::ClientConfig::new(host, "game", &local);
    config.transfer = mode;
    let err = UpdateClient::new(config)
        .unwrap()
        .with_hide(Arc::new(NoopHide))
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(!outer.path().join("escape.txt").exists());
}
