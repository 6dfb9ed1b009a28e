//! Registry mirror proxy.
//!
//! One shared caching/TLS-terminating proxy container per process. Nested
//! engines route image pulls through it and trust its generated CA, so
//! upstream registries are pulled from (and authenticated against) once
//! instead of per instance.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::engine::{EngineClient, PortSpec, Protocol};
use crate::error::{Error, Result};
use crate::handle::ContainerHandle;
use crate::settings::RegistryCredentials;

const PROXY_IMAGE: &str = "rpardini/docker-registry-proxy:0.6.5";
const PROXY_NAME: &str = "registry_proxy";
const PROXY_PORT: u16 = 3128;

/// Bound on certificate polling, one attempt per second. The proxy
/// generates its CA during first boot, which can take a while on slow
/// hosts.
const CERT_ATTEMPTS: u32 = 120;

/// How the CA certificate is retrieved from a proxy address. Seam
/// between the polling loop and the actual HTTP round-trip.
#[async_trait]
pub trait CertSource: Send + Sync {
    /// `Ok(None)` means the proxy is up but the certificate is not
    /// served yet; the caller keeps polling.
    async fn fetch(&self, ip: &str, port: u16) -> Result<Option<String>>;
}

struct HttpCertSource {
    http: reqwest::Client,
}

#[async_trait]
impl CertSource for HttpCertSource {
    async fn fetch(&self, ip: &str, port: u16) -> Result<Option<String>> {
        let url = format!("http://{ip}:{port}/ca.crt");
        let resp = match self.http.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                // The proxy's HTTP listener comes up after CA generation.
                debug!(url = %url, error = %e, "Proxy not answering yet");
                return Ok(None);
            }
        };
        if !resp.status().is_success() {
            return Ok(None);
        }
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Engine(format!("reading CA certificate body: {e}")))?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(body))
    }
}

pub struct RegistryProxy {
    handle: ContainerHandle,
    /// Many instances may request the proxy concurrently at startup;
    /// this serializes them so the container is started at most once.
    start_lock: Mutex<()>,
    cert_source: Arc<dyn CertSource>,
}

impl RegistryProxy {
    pub fn new(engine: Arc<dyn EngineClient>, credentials: &RegistryCredentials) -> Self {
        Self::with_cert_source(
            engine,
            credentials,
            Arc::new(HttpCertSource {
                http: reqwest::Client::new(),
            }),
        )
    }

    pub fn with_cert_source(
        engine: Arc<dyn EngineClient>,
        credentials: &RegistryCredentials,
        cert_source: Arc<dyn CertSource>,
    ) -> Self {
        let handle = ContainerHandle::new(engine, PROXY_IMAGE, PROXY_NAME);
        handle.set_auto_remove(true);
        handle.set_env("ENABLE_MANIFEST_CACHE", "true");
        handle.set_env("GENERATE_MIRRORING_CA", "true");
        handle.set_env("DISABLE_IPV6", "true");
        if !credentials.registries.is_empty() {
            handle.set_env("REGISTRIES", &credentials.registries);
        }
        if !credentials.auth_registries.is_empty() {
            handle.set_env("AUTH_REGISTRIES", &credentials.auth_registries);
        }
        handle.add_port(PortSpec {
            container_port: PROXY_PORT,
            protocol: Protocol::Tcp,
            host_port: None,
        });

        Self {
            handle,
            start_lock: Mutex::new(()),
            cert_source,
        }
    }

    pub fn port(&self) -> u16 {
        PROXY_PORT
    }

    /// Start the proxy if it is not already running. Safe to call from
    /// many instances concurrently.
    pub async fn ensure_started(&self) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        self.handle.ensure_started().await
    }

    /// The proxy's address on the engine's default network.
    pub async fn ip(&self) -> Result<String> {
        self.handle.ip().await
    }

    /// Fetch the proxy's generated CA certificate, polling until the
    /// proxy has finished generating it.
    pub async fn ca_cert(&self) -> Result<String> {
        self.ensure_started().await?;

        let mut last_detail = String::new();
        for attempt in 1..=CERT_ATTEMPTS {
            match self.try_fetch_cert().await {
                Ok(Some(pem)) => {
                    info!(attempts = attempt, "Retrieved registry proxy CA certificate");
                    return Ok(pem);
                }
                Ok(None) => {
                    debug!(attempt, "CA certificate not yet available");
                }
                Err(e) => {
                    debug!(attempt, error = %e, "CA certificate fetch failed");
                    last_detail = e.to_string();
                }
            }
            if attempt < CERT_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        let detail = match self.cert_dir_listing().await {
            Ok(listing) => listing,
            Err(_) => last_detail,
        };
        Err(Error::CertificateTimeout {
            attempts: CERT_ATTEMPTS,
            detail,
        })
    }

    async fn try_fetch_cert(&self) -> Result<Option<String>> {
        let ip = match self.handle.ip().await {
            Ok(ip) => ip,
            // Transient right after creation.
            Err(Error::NoIpAssigned(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.cert_source.fetch(&ip, PROXY_PORT).await
    }

    /// Diagnostic listing of the proxy's certificate directory, attached
    /// to the timeout error for operator debugging.
    async fn cert_dir_listing(&self) -> Result<String> {
        let out = self
            .handle
            .exec(
                vec!["ls".into(), "-la".into(), "/certs".into()],
                None,
            )
            .await?;
        Ok(out.output)
    }

    /// Proxy environment for a nested engine, pointing image pulls at
    /// this proxy. Must be applied before the nested container exists.
    pub async fn proxy_env(&self) -> Result<Vec<(String, String)>> {
        let ip = self.handle.ip().await?;
        let url = format!("http://{ip}:{PROXY_PORT}");
        Ok(vec![
            ("HTTP_PROXY".to_string(), url.clone()),
            ("HTTPS_PROXY".to_string(), url),
            ("NO_PROXY".to_string(), "localhost,127.0.0.1".to_string()),
        ])
    }

    /// Best-effort teardown; part of fleet shutdown.
    pub async fn cleanup(&self) {
        let _guard = self.start_lock.lock().await;
        self.handle.cleanup().await;
    }
}

impl std::fmt::Debug for RegistryProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryProxy")
            .field("name", &self.handle.scoped_name())
            .finish()
    }
}
