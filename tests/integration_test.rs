//! Integration tests for PipProxy
//!
//! Tests the facade end to end against a mock upstream index:
//! - Context constraints, inheritance and the push/pop stack
//! - Cache idempotence
//! - Route fallback and unknown packages
//! - Upstream failures, retries and abandoned downloads
//! - Percent-encoded filenames
//! - The HTTPS daemon with the generated certificates

use futures_util::StreamExt;
use pipproxy::{
    Binding, CertificateManager, CertificateOptions, ContextConfig, DaemonState, FacadeError,
    ProxyConfig, ProxyController, ProxyServer, Reply, SHUTDOWN_PATH,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PIP_VERSIONS: &[&str] = &[
    "1.5.4", "1.5.5", "1.5.6", "6.0", "6.0.8", "6.1.0", "6.1.1", "7.0.2", "7.0.3",
];

/// Mock index serving pip 1.5.4 through 7.0.3 as sdists
async fn run_index_server() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/simple/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><a href="../">up</a><a href="pip/">pip</a></body></html>"#,
        ))
        .mount(&server)
        .await;

    let links: String = PIP_VERSIONS
        .iter()
        .map(|v| format!("<a href=\"/packages/pip-{0}.tar.gz#md5=00{0}\">pip-{0}.tar.gz</a>\n", v))
        .collect();
    Mock::given(method("GET"))
        .and(path("/simple/pip/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(links))
        .mount(&server)
        .await;

    for version in PIP_VERSIONS.iter().filter(|v| **v != "6.1.1") {
        Mock::given(method("GET"))
            .and(path(format!("/packages/pip-{}.tar.gz", version)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(format!("sdist {}", version)))
            .mount(&server)
            .await;
    }

    server
}

fn config(index: &MockServer, cache: &Path) -> ProxyConfig {
    let mut config = ProxyConfig {
        indices: vec![Url::parse(&format!("{}/simple/", index.uri())).unwrap()],
        cache: cache.to_path_buf(),
        contexts: vec![ContextConfig {
            name: "mytest".to_string(),
            constraints: vec!["pip==6.1.1".to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };
    config.validate().unwrap();
    config
}

/// Filenames linked from a listing page
fn listed(reply: Reply) -> Vec<String> {
    let html = match reply {
        Reply::Html(html) => html,
        _ => panic!("expected a listing"),
    };
    html.lines()
        .filter_map(|line| line.split("\">").nth(1))
        .filter_map(|rest| rest.split("</a>").next())
        .map(str::to_string)
        .collect()
}

async fn read_body(reply: Reply) -> (u64, Vec<u8>) {
    let body = match reply {
        Reply::File(body) => body,
        _ => panic!("expected a file"),
    };
    let chunks: Vec<_> = body.stream.collect().await;
    let bytes = chunks.into_iter().flat_map(|c| c.unwrap().to_vec()).collect();
    (body.len, bytes)
}

#[tokio::test]
async fn test_context_stack_scenario() {
    let index = run_index_server().await;
    let dir = tempdir().unwrap();
    let controller = ProxyController::from_config(&config(&index, dir.path())).await.unwrap();

    assert!(controller.push_context("mytest"));
    let mytest = listed(controller.handle("/mytest/pip/").await.unwrap());
    assert_eq!(mytest, ["pip-6.1.1.tar.gz"]);

    controller
        .register_context("rad", None, &["pip".to_string()], "pip>=7", &[])
        .unwrap();
    assert!(controller.push_context("rad"));
    let rad = listed(controller.handle("/rad/pip/").await.unwrap());
    assert_eq!(rad, ["pip-7.0.2.tar.gz", "pip-7.0.3.tar.gz"]);

    assert!(controller.pop_context(None));
    assert_eq!(controller.active_context(), "mytest");
    assert_eq!(listed(controller.handle("/mytest/pip/").await.unwrap()), mytest);

    let everything = listed(controller.handle("/default/pip/").await.unwrap());
    assert_eq!(everything.len(), PIP_VERSIONS.len());
}

#[tokio::test]
async fn test_listing_keeps_fragments() {
    let index = run_index_server().await;
    let dir = tempdir().unwrap();
    let controller = ProxyController::from_config(&config(&index, dir.path())).await.unwrap();

    match controller.handle("/mytest/pip/").await.unwrap() {
        Reply::Html(html) => {
            assert!(html.contains("href=\"/mytest/pip/pip-6.1.1.tar.gz#md5=006.1.1\""));
        }
        _ => panic!("expected a listing"),
    }
}

#[tokio::test]
async fn test_second_download_comes_from_cache() {
    let index = run_index_server().await;
    Mock::given(method("GET"))
        .and(path("/packages/pip-6.1.1.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes("sdist 6.1.1"))
        .expect(1)
        .mount(&index)
        .await;

    let dir = tempdir().unwrap();
    let controller = ProxyController::from_config(&config(&index, dir.path())).await.unwrap();

    let first = read_body(controller.handle("/default/pip/pip-6.1.1.tar.gz").await.unwrap()).await;
    let second = read_body(controller.handle("/default/pip/pip-6.1.1.tar.gz").await.unwrap()).await;
    assert_eq!(first, (11, b"sdist 6.1.1".to_vec()));
    assert_eq!(first, second);
    assert!(dir.path().join("pip/pip-6.1.1.tar.gz").exists());

    index.verify().await;
}

#[tokio::test]
async fn test_cache_seeds_a_fresh_process() {
    let index = run_index_server().await;
    let dir = tempdir().unwrap();
    {
        let controller = ProxyController::from_config(&config(&index, dir.path())).await.unwrap();
        read_body(controller.handle("/default/pip/pip-7.0.3.tar.gz").await.unwrap()).await;
    }

    let offline = ProxyConfig {
        indices: vec![Url::parse("http://127.0.0.1:9/simple/").unwrap()],
        cache: dir.path().to_path_buf(),
        ..Default::default()
    };
    let controller = ProxyController::from_config(&offline).await.unwrap();
    let files = listed(controller.handle("/default/pip/").await.unwrap());
    assert_eq!(files, ["pip-7.0.3.tar.gz"]);
    let (_, bytes) = read_body(controller.handle("/default/pip/pip-7.0.3.tar.gz").await.unwrap()).await;
    assert_eq!(bytes, b"sdist 7.0.3");
}

#[tokio::test]
async fn test_unknown_context_falls_back_to_active() {
    let index = run_index_server().await;
    let dir = tempdir().unwrap();
    let controller = ProxyController::from_config(&config(&index, dir.path())).await.unwrap();
    controller.push_context("mytest");

    assert_eq!(
        listed(controller.handle("/pip/").await.unwrap()),
        ["pip-6.1.1.tar.gz"]
    );
    assert_eq!(
        listed(controller.handle("/nosuch/pip/").await.unwrap()),
        ["pip-6.1.1.tar.gz"]
    );
}

#[tokio::test]
async fn test_unknown_package_is_not_found() {
    let index = run_index_server().await;
    let dir = tempdir().unwrap();
    let controller = ProxyController::from_config(&config(&index, dir.path())).await.unwrap();

    assert!(matches!(
        controller.handle("/default/nosuch/").await.unwrap(),
        Reply::NotFound(_)
    ));
    assert!(controller
        .handle("/default/pip/pip-9.9.9.tar.gz")
        .await
        .is_err());
}

#[tokio::test]
async fn test_failed_listing_is_rederived_from_index() {
    let index = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/simple/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"<a href="/mirror/pip/">pip</a>"#))
        .expect(1)
        .mount(&index)
        .await;
    Mock::given(method("GET"))
        .and(path("/simple/pip/"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&index)
        .await;
    Mock::given(method("GET"))
        .and(path("/mirror/pip/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<a href="/packages/pip-6.1.1.tar.gz">a</a><a href="/packages/pip-7.0.3.tar.gz">b</a>"#,
        ))
        .expect(1)
        .mount(&index)
        .await;

    let dir = tempdir().unwrap();
    let controller = ProxyController::from_config(&config(&index, dir.path())).await.unwrap();

    let files = listed(controller.handle("/default/pip/").await.unwrap());
    assert_eq!(files, ["pip-6.1.1.tar.gz", "pip-7.0.3.tar.gz"]);
    assert_eq!(listed(controller.handle("/default/pip/").await.unwrap()), files);

    index.verify().await;
}

#[tokio::test]
async fn test_missing_top_level_listing_is_fetched_once() {
    let index = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/simple/"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&index)
        .await;

    let dir = tempdir().unwrap();
    let controller = ProxyController::from_config(&config(&index, dir.path())).await.unwrap();

    assert!(listed(controller.handle("/default/").await.unwrap()).is_empty());
    assert!(listed(controller.handle("/default/").await.unwrap()).is_empty());

    index.verify().await;
}

#[tokio::test]
async fn test_all_sources_failing_is_not_available() {
    let index = run_index_server().await;
    let dir = tempdir().unwrap();
    let controller = ProxyController::from_config(&config(&index, dir.path())).await.unwrap();

    // pip-6.1.1 is listed but its download URL answers 404.
    let err = controller
        .handle("/default/pip/pip-6.1.1.tar.gz")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FacadeError::NotAvailable { .. }));
    assert!(!dir.path().join("pip/pip-6.1.1.tar.gz").exists());
}

#[tokio::test]
async fn test_abandoned_download_leaves_no_partial_file() {
    let index = run_index_server().await;
    Mock::given(method("GET"))
        .and(path("/packages/pip-6.1.1.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 1 << 20]))
        .mount(&index)
        .await;

    let dir = tempdir().unwrap();
    let controller = ProxyController::from_config(&config(&index, dir.path())).await.unwrap();

    let mut body = match controller.handle("/default/pip/pip-6.1.1.tar.gz").await.unwrap() {
        Reply::File(body) => body,
        _ => panic!("expected a file"),
    };
    assert_eq!(body.len, 1 << 20);
    assert!(body.stream.next().await.unwrap().is_ok());
    drop(body);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("pip")).unwrap().collect();
    assert!(leftovers.is_empty());
    let guard = controller.state().lock();
    let entry = guard.image.package("pip").unwrap().file("pip-6.1.1.tar.gz").unwrap();
    assert!(entry.cached_path.is_none());
}

#[tokio::test]
async fn test_local_version_files_are_served() {
    const WHEEL: &str = "torch-2.0.0+cpu-cp311-cp311-linux_x86_64.whl";
    let index = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/simple/torch/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<a href="/whl/torch-2.0.0%2Bcpu-cp311-cp311-linux_x86_64.whl">torch</a>"#,
        ))
        .mount(&index)
        .await;
    Mock::given(method("GET"))
        .and(path("/whl/torch-2.0.0%2Bcpu-cp311-cp311-linux_x86_64.whl"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes("wheel"))
        .mount(&index)
        .await;

    let dir = tempdir().unwrap();
    let controller = ProxyController::from_config(&config(&index, dir.path())).await.unwrap();
    controller
        .register_context("cpu", Some("default"), &[], "torch>=2", &[])
        .unwrap();

    match controller.handle("/cpu/torch/").await.unwrap() {
        Reply::Html(html) => {
            assert!(html.contains("href=\"/cpu/torch/torch-2.0.0%2Bcpu-cp311-cp311-linux_x86_64.whl\""));
        }
        _ => panic!("expected a listing"),
    }

    let (len, bytes) = read_body(controller.handle(&format!("/cpu/torch/{}", WHEEL)).await.unwrap()).await;
    assert_eq!((len, bytes), (5, b"wheel".to_vec()));
    assert!(dir.path().join("torch").join(WHEEL).exists());
}

#[tokio::test]
async fn test_constraining_index_pins_default_context() {
    let index = run_index_server().await;
    let mirror = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/simple/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"<a href="pip/">pip</a>"#))
        .mount(&mirror)
        .await;
    Mock::given(method("GET"))
        .and(path("/simple/pip/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<a href="/p/pip-1.5.6.tar.gz">a</a><a href="/p/pip-7.0.2.tar.gz">b</a>"#,
        ))
        .mount(&mirror)
        .await;

    let dir = tempdir().unwrap();
    let mut config = config(&index, dir.path());
    config.constraining_indices = vec![Url::parse(&format!("{}/simple/", mirror.uri())).unwrap()];
    config.contexts.clear();
    let controller = ProxyController::from_config(&config).await.unwrap();

    assert_eq!(
        listed(controller.handle("/default/pip/").await.unwrap()),
        ["pip-1.5.6.tar.gz", "pip-7.0.2.tar.gz"]
    );
}

#[tokio::test]
async fn test_https_daemon() {
    let index = run_index_server().await;
    let dir = tempdir().unwrap();
    let controller = Arc::new(
        ProxyController::from_config(&config(&index, &dir.path().join("cache")))
            .await
            .unwrap(),
    );

    let mut certs = CertificateManager::new(CertificateOptions {
        certpath: dir.path().join("certs"),
        hosts: vec!["127.0.0.1".to_string()],
        ..Default::default()
    })
    .unwrap();
    certs.generate().unwrap();

    let server = Arc::new(ProxyServer::new(controller, certs.server_config().unwrap()));
    let addr = server
        .start(Binding::Address {
            interface: "127.0.0.1".to_string(),
            ports: 0..=0,
        })
        .await
        .unwrap();
    assert_eq!(server.state(), DaemonState::Listening);

    let root = reqwest::Certificate::from_pem(certs.root_pem().unwrap().as_bytes()).unwrap();
    let client = reqwest::Client::builder()
        .add_root_certificate(root)
        .build()
        .unwrap();
    let base = format!("https://127.0.0.1:{}", addr.port());

    let response = client.get(format!("{}/mytest/pip/", base)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().contains("pip-6.1.1.tar.gz"));

    let response = client
        .get(format!("{}/mytest/pip/pip-7.0.3.tar.gz", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.content_length(), Some(11));
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"sdist 7.0.3");

    let response = client.post(format!("{}/mytest/pip/", base)).send().await.unwrap();
    assert_eq!(response.status(), 405);

    let response = client.get(format!("{}{}", base, SHUTDOWN_PATH)).send().await.unwrap();
    assert_eq!(response.status(), 503);

    let response = client.get(format!("{}/mytest/nosuch/", base)).send().await.unwrap();
    assert_eq!(response.status(), 404);

    server.stop().await;
    assert_eq!(server.state(), DaemonState::Stopped);

    certs.delete();
    assert!(!dir.path().join("certs/root.crt").exists());
}
