//! Kubernetes API directory.
//!
//! Reads either the endpoints object of a service or a label-selected pod
//! listing. The HTTP client is built on first use and dropped by
//! [`KubernetesDirectory::close`]; the next query builds a new one.

use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::config::ApiConfig;
use crate::directory::{Directory, DirectoryError, EndpointPort, EndpointRecord};

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone)]
enum Target {
    Endpoints { service: String },
    Pods { selector: String },
}

/// Directory backed by the Kubernetes API server.
#[derive(Debug)]
pub struct KubernetesDirectory {
    api: ApiConfig,
    client: Mutex<Option<reqwest::Client>>,
    namespace: String,
    target: Target,
    timeout: Duration,
}

impl KubernetesDirectory {
    /// Query the endpoints object of `service`.
    pub fn endpoints(
        namespace: Option<String>,
        service: String,
        api: ApiConfig,
        timeout: Duration,
    ) -> Self {
        Self::new(namespace, Target::Endpoints { service }, api, timeout)
    }

    /// Query running pods matching `selector`.
    pub fn pods(
        namespace: Option<String>,
        selector: String,
        api: ApiConfig,
        timeout: Duration,
    ) -> Self {
        Self::new(namespace, Target::Pods { selector }, api, timeout)
    }

    fn new(namespace: Option<String>, target: Target, api: ApiConfig, timeout: Duration) -> Self {
        let namespace = namespace
            .or_else(|| read_trimmed(&api.namespace_path))
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        debug!(namespace = %namespace, target = ?target, "Kubernetes directory initialized");

        Self {
            api,
            client: Mutex::new(None),
            namespace,
            target,
            timeout,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// GET a JSON document. `None` on 404.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, DirectoryError> {
        let url = format!("{}{}", self.base_url()?, path);
        let client = self.client().await?;

        let mut request = client.get(&url).query(query);
        if let Some(token) = read_token(&self.api.token_path).await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(DirectoryError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| DirectoryError::Malformed(e.to_string()))
    }

    async fn client(&self) -> Result<reqwest::Client, DirectoryError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        match tokio::fs::read(&self.api.ca_path).await {
            Ok(pem) => {
                builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(path = %self.api.ca_path.display(), "No cluster CA bundle found");
            }
            Err(e) => return Err(e.into()),
        }

        let client = builder.build()?;
        debug!(namespace = %self.namespace, "Kubernetes client created");
        *slot = Some(client.clone());
        Ok(client)
    }

    fn base_url(&self) -> Result<String, DirectoryError> {
        api_base_url(
            self.api.api_url.as_deref(),
            std::env::var("KUBERNETES_SERVICE_HOST").ok(),
            std::env::var("KUBERNETES_SERVICE_PORT").ok(),
        )
    }
}

/// The configured URL, else the in-cluster service host and port.
fn api_base_url(
    api_url: Option<&str>,
    host: Option<String>,
    port: Option<String>,
) -> Result<String, DirectoryError> {
    if let Some(url) = api_url {
        return Ok(url.trim_end_matches('/').to_string());
    }

    let host = host.filter(|h| !h.is_empty()).ok_or_else(|| {
        DirectoryError::Unconfigured("KUBERNETES_SERVICE_HOST is not set".to_string())
    })?;
    let port = port.unwrap_or_else(|| "443".to_string());

    if host.contains(':') {
        Ok(format!("https://[{host}]:{port}"))
    } else {
        Ok(format!("https://{host}:{port}"))
    }
}

impl Directory for KubernetesDirectory {
    async fn query(&self) -> Result<Vec<EndpointRecord>, DirectoryError> {
        match &self.target {
            Target::Endpoints { service } => {
                debug!(service = %service, namespace = %self.namespace, "Fetching service endpoints");
                let path = format!(
                    "/api/v1/namespaces/{}/endpoints/{}",
                    self.namespace, service
                );
                let endpoints: Endpoints =
                    self.get(&path, &[]).await?.ok_or_else(|| DirectoryError::NotFound {
                        kind: "endpoints",
                        namespace: self.namespace.clone(),
                        name: service.clone(),
                    })?;
                Ok(endpoints_to_records(endpoints))
            }
            Target::Pods { selector } => {
                debug!(selector = %selector, namespace = %self.namespace, "Fetching pods");
                let path = format!("/api/v1/namespaces/{}/pods", self.namespace);
                let pods: PodList = self
                    .get(&path, &[("labelSelector", selector.as_str())])
                    .await?
                    .ok_or_else(|| DirectoryError::NotFound {
                        kind: "pods",
                        namespace: self.namespace.clone(),
                        name: selector.clone(),
                    })?;
                Ok(pods_to_records(pods))
            }
        }
    }

    /// Drop the HTTP client and its connection pool.
    async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            debug!(namespace = %self.namespace, "Kubernetes client released");
        }
    }
}

/// Read the service-account token. Tokens rotate, so this runs per request.
async fn read_token(path: &Path) -> Result<Option<String>, DirectoryError> {
    match tokio::fs::read_to_string(path).await {
        Ok(token) => Ok(Some(token.trim().to_string()).filter(|t| !t.is_empty())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// ============================================================================
// API objects (only the fields discovery reads)
// ============================================================================

#[derive(Debug, Deserialize)]
struct Endpoints {
    subsets: Option<Vec<EndpointSubset>>,
}

#[derive(Debug, Deserialize)]
struct EndpointSubset {
    addresses: Option<Vec<EndpointAddress>>,
    ports: Option<Vec<EndpointPortSpec>>,
}

#[derive(Debug, Deserialize)]
struct EndpointAddress {
    ip: Option<String>,
    hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndpointPortSpec {
    name: Option<String>,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct PodList {
    items: Option<Vec<Pod>>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: Option<PodMetadata>,
    status: Option<PodStatus>,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    phase: Option<String>,
    #[serde(rename = "podIP")]
    pod_ip: Option<String>,
}

fn endpoints_to_records(endpoints: Endpoints) -> Vec<EndpointRecord> {
    let mut records = Vec::new();

    for subset in endpoints.subsets.unwrap_or_default() {
        let ports: Vec<EndpointPort> = subset
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| EndpointPort {
                name: p.name,
                port: p.port,
            })
            .collect();

        for address in subset.addresses.unwrap_or_default() {
            match address.ip.or(address.hostname) {
                Some(addr) => records.push(EndpointRecord {
                    address: addr,
                    ports: ports.clone(),
                }),
                None => warn!("Ignoring endpoint address without ip or hostname"),
            }
        }
    }

    records
}

fn pods_to_records(pods: PodList) -> Vec<EndpointRecord> {
    let mut records = Vec::new();

    for pod in pods.items.unwrap_or_default() {
        let name = pod
            .metadata
            .and_then(|m| m.name)
            .unwrap_or_else(|| "<unnamed>".to_string());
        let Some(status) = pod.status else {
            trace!(pod = %name, "Pod has no status, ignoring");
            continue;
        };

        if status.phase.as_deref() != Some("Running") {
            trace!(pod = %name, phase = ?status.phase, "Pod is not running, ignoring");
            continue;
        }

        match status.pod_ip {
            Some(ip) if !ip.is_empty() => records.push(EndpointRecord::new(ip)),
            _ => trace!(pod = %name, "Pod has no IP yet, ignoring"),
        }
    }

    records
}
