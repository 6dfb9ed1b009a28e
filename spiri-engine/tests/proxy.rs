mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::FakeEngine;
use spiri_engine::engine::{EngineClient, ExecOutput};
use spiri_engine::error::{Error, Result};
use spiri_engine::proxy::{CertSource, RegistryProxy};
use spiri_engine::settings::RegistryCredentials;

const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

/// Hands out a scripted sequence of fetch results; exhausted means "not
/// served yet", like a proxy that never finishes CA generation.
struct ScriptedCerts {
    responses: Mutex<VecDeque<Option<String>>>,
}

impl ScriptedCerts {
    fn new(responses: Vec<Option<String>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
        })
    }
}

#[async_trait]
impl CertSource for ScriptedCerts {
    async fn fetch(&self, _ip: &str, _port: u16) -> Result<Option<String>> {
        Ok(self.responses.lock().unwrap().pop_front().unwrap_or(None))
    }
}

fn proxy(engine: Arc<FakeEngine>, source: Arc<ScriptedCerts>) -> RegistryProxy {
    RegistryProxy::with_cert_source(
        engine as Arc<dyn EngineClient>,
        &RegistryCredentials::default(),
        source,
    )
}

#[tokio::test]
async fn concurrent_requests_start_the_proxy_once() {
    let engine = FakeEngine::new();
    let proxy = proxy(engine.clone(), ScriptedCerts::new(vec![]));

    let (a, b) = tokio::join!(proxy.ensure_started(), proxy.ensure_started());
    a.unwrap();
    b.unwrap();

    assert_eq!(engine.created_count(), 1);
    assert_eq!(engine.container_names(), vec!["spirisdk_registry_proxy"]);
}

#[tokio::test(start_paused = true)]
async fn ca_cert_polls_until_the_certificate_is_served() {
    let engine = FakeEngine::new();
    let source = ScriptedCerts::new(vec![None, None, Some(PEM.to_string())]);
    let proxy = proxy(engine.clone(), source);

    let pem = proxy.ca_cert().await.unwrap();
    assert_eq!(pem, PEM);
}

#[tokio::test(start_paused = true)]
async fn ca_cert_timeout_carries_the_certificate_directory_listing() {
    let engine = FakeEngine::new();
    let proxy = proxy(engine.clone(), ScriptedCerts::new(vec![]));
    proxy.ensure_started().await.unwrap();
    engine.push_exec_result(ExecOutput {
        exit_code: 0,
        output: "total 0".to_string(),
    });

    let before = tokio::time::Instant::now();
    let err = proxy.ca_cert().await.unwrap_err();
    // Sleeps only between attempts, not after the last one.
    assert_eq!(before.elapsed(), std::time::Duration::from_secs(119));
    match err {
        Error::CertificateTimeout { attempts, detail } => {
            assert_eq!(attempts, 120);
            assert_eq!(detail, "total 0");
        }
        other => panic!("expected certificate timeout, got {other}"),
    }
    // The diagnostic listing ran inside the proxy container.
    assert!(engine
        .execs()
        .iter()
        .any(|e| e.cmd.first().map(String::as_str) == Some("ls")));
}

#[tokio::test]
async fn proxy_env_points_pulls_at_the_proxy() {
    let engine = FakeEngine::new();
    let proxy = proxy(engine.clone(), ScriptedCerts::new(vec![]));
    proxy.ensure_started().await.unwrap();

    let env = proxy.proxy_env().await.unwrap();
    let http = env.iter().find(|(k, _)| k == "HTTP_PROXY").unwrap();
    assert!(http.1.starts_with("http://"));
    assert!(http.1.ends_with(":3128"));
    let https = env.iter().find(|(k, _)| k == "HTTPS_PROXY").unwrap();
    assert_eq!(https.1, http.1);
    assert!(env
        .iter()
        .any(|(k, v)| k == "NO_PROXY" && v.contains("localhost")));
}
