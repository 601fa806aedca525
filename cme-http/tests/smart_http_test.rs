//! Smart-HTTP integration tests
//!
//! These tests validate:
//! - Routing and protocol error responses
//! - Ref advertisement framing
//! - A real `git clone` and `git push` through the handler, including
//!   transaction finalization and pack-received listeners
//!
//! Require `git` on PATH.

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use http_body_util::{BodyExt, Full};
use std::io::Write;
use hyper::{Request, StatusCode, Version};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::net::TcpListener;

use cme_core::{
    Author, ChangeRecord, Engine, EngineConfig, ObjectContent, ObjectType, TransactionStatus,
    listener_fn,
};
use cme_http::SmartHttpHandler;
use cme_http::pktline::{Packet, read_packets};

fn engine_with(tmp: &TempDir, receive_pack: bool) -> Arc<Engine> {
    let mut config = EngineConfig::new(tmp.path().join("repos")).with_bin_path("git");
    config.receive_pack = receive_pack;
    Arc::new(Engine::new(config).unwrap())
}

fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn body_bytes(resp: cme_http::HttpResponse) -> Bytes {
    resp.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test]
async fn test_unknown_paths_not_found() {
    let tmp = TempDir::new().unwrap();
    let handler = SmartHttpHandler::new(engine_with(&tmp, true)).unwrap();

    let resp = handler.handle(get("/device/cme/config")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_bytes(resp).await, "Not Found");

    let resp = handler.handle(get("/widget/cme/info/refs")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_wrong_method() {
    let tmp = TempDir::new().unwrap();
    let handler = SmartHttpHandler::new(engine_with(&tmp, true)).unwrap();

    let resp = handler
        .handle(get("/device/cme/git-upload-pack"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body_bytes(resp).await, "Method Not Allowed");

    let req = Request::builder()
        .method("GET")
        .version(Version::HTTP_10)
        .uri("/device/cme/git-upload-pack")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = handler.handle(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rpc_access_checks() {
    let tmp = TempDir::new().unwrap();
    let handler = SmartHttpHandler::new(engine_with(&tmp, false)).unwrap();

    // Wrong content type.
    let req = Request::builder()
        .method("POST")
        .uri("/policy/cme/git-upload-pack")
        .header("Content-Type", "application/octet-stream")
        .body(Full::new(Bytes::from_static(b"0000")))
        .unwrap();
    let resp = handler.handle(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_bytes(resp).await, "Forbidden");

    // Receive-pack disabled.
    let req = Request::builder()
        .method("POST")
        .uri("/policy/cme/git-receive-pack")
        .header("Content-Type", "application/x-git-receive-pack-request")
        .body(Full::new(Bytes::from_static(b"0000")))
        .unwrap();
    let resp = handler.handle(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

fn upload_pack() -> hyper::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri("/device/cme/git-upload-pack")
        .header("Content-Type", "application/x-git-upload-pack-request")
}

#[tokio::test]
async fn test_declared_oversized_body_rejected() {
    let tmp = TempDir::new().unwrap();
    let handler = SmartHttpHandler::new(engine_with(&tmp, true))
        .unwrap()
        .with_max_body_size(16);

    let body = vec![b'0'; 64];
    let req = upload_pack()
        .header("Content-Length", body.len().to_string())
        .body(Full::new(Bytes::from(body)))
        .unwrap();
    let resp = handler.handle(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_bytes(resp).await, "Payload Too Large");
}

#[tokio::test]
async fn test_undeclared_oversized_body_aborts_response() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, true);
    let handler = SmartHttpHandler::new(Arc::clone(&engine))
        .unwrap()
        .with_max_body_size(16);

    let req = upload_pack()
        .body(Full::new(Bytes::from(vec![b'0'; 64])))
        .unwrap();
    let resp = handler.handle(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.into_body().collect().await.is_err());

    // The type's lock was released and the tree is clean.
    let lock = engine.repos().lock(ObjectType::Device).await;
    assert!(!engine.repos().is_dirty(&lock).await.unwrap());
}

#[tokio::test]
async fn test_gzip_bomb_aborts_response() {
    let tmp = TempDir::new().unwrap();
    let handler = SmartHttpHandler::new(engine_with(&tmp, true))
        .unwrap()
        .with_max_body_size(64 * 1024);

    let mut enc = GzEncoder::new(Vec::new(), Compression::best());
    enc.write_all(&vec![0u8; 8 << 20]).unwrap();
    let bomb = enc.finish().unwrap();
    assert!(bomb.len() < 64 * 1024);

    let req = upload_pack()
        .header("Content-Encoding", "gzip")
        .header("Content-Length", bomb.len().to_string())
        .body(Full::new(Bytes::from(bomb)))
        .unwrap();
    let resp = handler.handle(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.into_body().collect().await.is_err());

    // A well-formed request on the same type still goes through.
    let resp = handler
        .handle(get("/device/cme/info/refs?service=git-upload-pack"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_ref_advertisement() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, true);
    let handler = SmartHttpHandler::new(Arc::clone(&engine)).unwrap();

    let resp = handler
        .handle(get("/device/cme/info/refs?service=git-upload-pack"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["Content-Type"],
        "application/x-git-upload-pack-advertisement"
    );
    assert_eq!(
        resp.headers()["Cache-Control"],
        "no-cache, max-age=0, must-revalidate"
    );

    let body = body_bytes(resp).await;
    assert!(body.starts_with(b"001e# service=git-upload-pack\n0000"));

    let (packets, rest) = read_packets(&body);
    assert!(rest.is_empty());
    let master = engine.latest_commit_id(ObjectType::Device).await.unwrap();
    let advertised = packets.iter().any(|p| match p {
        Packet::Data(line) => {
            let line = String::from_utf8_lossy(line);
            line.starts_with(&master) && line.contains("refs/heads/master")
        }
        Packet::Flush => false,
    });
    assert!(advertised, "master {} not advertised", master);
}

#[tokio::test]
async fn test_dumb_files() {
    let tmp = TempDir::new().unwrap();
    let handler = SmartHttpHandler::new(engine_with(&tmp, true)).unwrap();

    let resp = handler.handle(get("/query/cme/HEAD")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["Pragma"], "no-cache");
    assert_eq!(body_bytes(resp).await, "ref: refs/heads/master\n");

    // Without a service the dumb info/refs file is generated and served.
    let resp = handler.handle(get("/query/cme/info/refs")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_bytes(resp).await;
    assert!(String::from_utf8_lossy(&body).contains("refs/heads/master"));

    let missing = format!("/query/cme/objects/pack/pack-{}.pack", "0".repeat(40));
    let resp = handler.handle(get(&missing)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

/// Spawn a local HTTP server around the handler and return its address.
async fn spawn_test_server(handler: Arc<SmartHttpHandler>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => continue,
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = hyper::service::service_fn(move |req| {
                    let handler = Arc::clone(&handler);
                    async move {
                        handler.handle(req).await.map_err(|e| {
                            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
                        })
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    addr
}

async fn git(dir: &Path, args: &[&str]) {
    let out = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clone_and_push_over_http() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, true);

    let packs = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&packs);
    engine.register_pack_listener(
        ObjectType::Device,
        listener_fn(move |record| {
            assert_eq!(record.src_node.as_deref(), Some("peer1"));
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let commits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&commits);
    engine.register_commit_listener(
        ObjectType::Device,
        listener_fn(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let staged = ChangeRecord::new(
        ObjectType::Device,
        ObjectContent::new("sw1").with_file("config", b"staged".to_vec()),
        Author::new("Ops", "ops@example.net"),
    );
    let trans = engine.begin_transaction(&staged, "").await.unwrap();

    let handler = Arc::new(SmartHttpHandler::new(Arc::clone(&engine)).unwrap());
    let addr = spawn_test_server(handler).await;
    let base = format!("http://{}/device/cme", addr);

    let work = TempDir::new().unwrap();
    git(work.path(), &["clone", "-q", &base, "clone"]).await;
    let clone = work.path().join("clone");
    assert!(clone.join("README").exists());

    std::fs::create_dir_all(clone.join("sw9/data")).unwrap();
    std::fs::write(clone.join("sw9/data/config"), "pushed over http\n").unwrap();
    git(&clone, &["add", "sw9"]).await;
    git(
        &clone,
        &[
            "-c",
            "user.name=Peer",
            "-c",
            "user.email=peer@example.net",
            "commit",
            "-q",
            "-m",
            "From peer",
        ],
    )
    .await;
    let push_url = format!("{}/src=peer1/trans={}", base, trans);
    git(&clone, &["push", "-q", &push_url, "master:master"]).await;

    assert_eq!(packs.load(Ordering::SeqCst), 1);
    assert_eq!(commits.load(Ordering::SeqCst), 1);
    assert_eq!(
        engine.transaction_status(&trans).await,
        Some(TransactionStatus::Complete)
    );

    let record = engine.get_object(ObjectType::Device, "sw9").await.unwrap();
    assert_eq!(record.content.files["config"], b"pushed over http\n");
    assert_eq!(record.author.name, "Peer");

    // The working tree follows the pushed master.
    let dir = engine.repo_dir(ObjectType::Device).unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.join("sw9/data/config")).unwrap(),
        "pushed over http\n"
    );
}
