use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::RefreshPolicy;
use crate::directory::DirectoryQuery;
use crate::RosterError;

/// Flat settings keys understood by [`Config::from_settings`].
pub mod keys {
    pub const NAMESPACE: &str = "cloud.kubernetes.namespace";
    pub const SERVICE_NAME: &str = "cloud.kubernetes.service";
    pub const POD_LABEL: &str = "cloud.kubernetes.pod_label";
    pub const POD_PORT: &str = "cloud.kubernetes.pod_port";
    pub const REFRESH: &str = "cloud.kubernetes.refresh_interval";
    pub const QUERY_TIMEOUT: &str = "cloud.kubernetes.query_timeout";
    pub const API_URL: &str = "cloud.kubernetes.api_url";
    pub const PUBLISH_HOST: &str = "cloud.kubernetes.publish_host";

    /// Legacy selector key, used when `pod_label` is absent.
    pub const LEGACY_SELECTOR: &str = "cloud.k8s.selector";
    /// Legacy headless-service DNS name.
    pub const LEGACY_SERVICE_DNS: &str = "cloud.k8s.servicedns";
    /// Legacy refresh interval, used when `refresh_interval` is absent.
    pub const LEGACY_REFRESH: &str = "cloud.k8s.refresh_interval";
}

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Resolver configuration.
///
/// The consumer constructs this struct however they want (struct literal,
/// serde, or [`Config::from_settings`]).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where peers are looked up.
    pub directory: DirectoryConfig,
    /// Port used for records that carry no ports of their own.
    pub default_port: Option<u16>,
    /// Signed refresh interval in milliseconds: `0` disables caching,
    /// positive values are a TTL, negative values cache forever.
    pub refresh_interval_ms: i64,
    /// Upper bound on a single directory query (ms).
    pub query_timeout_ms: u64,
    /// Compatibility token stamped on every produced peer node.
    pub protocol_version: String,
    /// Explicit publish host. When unset the local address is detected.
    pub publish_host: Option<String>,
}

/// Directory selection. Checked in order: label selector, service name,
/// DNS name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Kubernetes namespace. Falls back to the service-account namespace.
    pub namespace: Option<String>,
    /// Service whose endpoints object lists the peers.
    pub service_name: Option<String>,
    /// Label selector for a pod listing (e.g. `app=search`).
    pub label_selector: Option<String>,
    /// Headless service DNS name.
    pub dns_name: Option<String>,
    /// Kubernetes API access.
    pub api: ApiConfig,
}

/// Kubernetes API access. Defaults follow the in-cluster conventions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API server base URL. When unset, built from
    /// `KUBERNETES_SERVICE_HOST` and `KUBERNETES_SERVICE_PORT`.
    pub api_url: Option<String>,
    pub token_path: PathBuf,
    pub ca_path: PathBuf,
    pub namespace_path: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let dir = PathBuf::from(SERVICE_ACCOUNT_DIR);
        Self {
            api_url: None,
            token_path: dir.join("token"),
            ca_path: dir.join("ca.crt"),
            namespace_path: dir.join("namespace"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: DirectoryConfig::default(),
            default_port: None,
            refresh_interval_ms: 0,
            query_timeout_ms: 5000,
            protocol_version: String::new(),
            publish_host: None,
        }
    }
}

impl Config {
    /// Caching mode derived from `refresh_interval_ms`.
    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy::from_millis(self.refresh_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Select the directory query shape, failing if the settings do not
    /// name one, if the shape needs a default port that is missing, or if
    /// the query timeout is zero.
    pub fn query(&self) -> Result<DirectoryQuery, RosterError> {
        if self.query_timeout_ms == 0 {
            return Err(RosterError::InvalidSetting {
                key: keys::QUERY_TIMEOUT.to_string(),
                value: "0".to_string(),
            });
        }

        let d = &self.directory;
        let namespace = non_empty(&d.namespace);

        let query = if let Some(selector) = non_empty(&d.label_selector) {
            DirectoryQuery::Selector {
                namespace,
                selector,
            }
        } else if let Some(service) = non_empty(&d.service_name) {
            DirectoryQuery::Service { namespace, service }
        } else if let Some(name) = non_empty(&d.dns_name) {
            DirectoryQuery::Dns { name }
        } else {
            return Err(RosterError::ConfigurationIncomplete(
                "one of label_selector, service_name or dns_name must be set".to_string(),
            ));
        };

        // Pod listings and DNS answers carry no ports of their own.
        if !matches!(query, DirectoryQuery::Service { .. }) && self.default_port.is_none() {
            return Err(RosterError::ConfigurationIncomplete(format!(
                "{query} requires a default port"
            )));
        }

        Ok(query)
    }

    /// Build a config from flat `key = value` settings (see [`keys`]).
    pub fn from_settings(settings: &HashMap<String, String>) -> Result<Self, RosterError> {
        let get = |key: &str| {
            settings
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Config::default();
        config.directory.namespace = get(keys::NAMESPACE);
        config.directory.service_name = get(keys::SERVICE_NAME);
        config.directory.label_selector =
            get(keys::POD_LABEL).or_else(|| get(keys::LEGACY_SELECTOR));
        config.directory.dns_name = get(keys::LEGACY_SERVICE_DNS);
        config.directory.api.api_url = get(keys::API_URL);
        config.publish_host = get(keys::PUBLISH_HOST);

        if let Some(raw) = get(keys::POD_PORT) {
            let port: u16 = raw.parse().map_err(|_| invalid(keys::POD_PORT, &raw))?;
            // 0 means "unset".
            config.default_port = (port != 0).then_some(port);
        }
        if let Some(raw) = get(keys::REFRESH) {
            config.refresh_interval_ms =
                parse_interval(&raw).ok_or_else(|| invalid(keys::REFRESH, &raw))?;
        } else if let Some(raw) = get(keys::LEGACY_REFRESH) {
            config.refresh_interval_ms =
                parse_interval(&raw).ok_or_else(|| invalid(keys::LEGACY_REFRESH, &raw))?;
        }
        if let Some(raw) = get(keys::QUERY_TIMEOUT) {
            config.query_timeout_ms = parse_interval(&raw)
                .and_then(|ms| u64::try_from(ms).ok())
                .filter(|ms| *ms > 0)
                .ok_or_else(|| invalid(keys::QUERY_TIMEOUT, &raw))?;
        }

        Ok(config)
    }
}

/// Parse a signed time value into milliseconds.
///
/// Accepts bare milliseconds (`-1`, `0`, `1500`) or a number followed by
/// `ms`, `s`, `m`, `h` or `d`.
pub fn parse_interval(raw: &str) -> Option<i64> {
    const UNITS: [(&str, i64); 5] = [
        ("ms", 1),
        ("s", 1_000),
        ("m", 60_000),
        ("h", 3_600_000),
        ("d", 86_400_000),
    ];

    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Some(ms);
    }

    UNITS.iter().find_map(|(suffix, factor)| {
        let value: i64 = raw.strip_suffix(suffix)?.trim().parse().ok()?;
        value.checked_mul(*factor)
    })
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn invalid(key: &str, value: &str) -> RosterError {
    RosterError::InvalidSetting {
        key: key.to_string(),
        value: value.to_string(),
    }
}
