//! Kubernetes-backed bundle source.
//!
//! Bundles are cluster-scoped `ClusterConfigMap` custom resources.  The
//! client authenticates with the pod's service account: the API server CA
//! is loaded once at construction, the bearer token is re-read on every
//! request so projected-token rotation is picked up.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::{Certificate, Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{Bundle, ConfigSource};
use crate::error::CcmError;

/// API group of the `ClusterConfigMap` resource.
pub const API_GROUP: &str = "indeed.com";

/// API version of the `ClusterConfigMap` resource.
pub const API_VERSION: &str = "v1alpha1";

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Longest valid object name (DNS-1123 subdomain).
const MAX_OBJECT_NAME_LEN: usize = 253;

/// Wire shape of a `ClusterConfigMap`; only `data` matters here.
#[derive(Debug, Deserialize)]
struct ClusterConfigMap {
    #[serde(default)]
    data: Option<Bundle>,
}

/// Fetches `ClusterConfigMap` objects from the Kubernetes API server.
pub struct KubeConfigSource {
    client: Client,
    base_url: String,
    token_path: Option<PathBuf>,
}

impl KubeConfigSource {
    /// Create a source talking to `base_url`.
    ///
    /// When `token_path` is set its content is sent as a bearer token.
    pub fn new(client: Client, base_url: impl Into<String>, token_path: Option<PathBuf>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token_path,
        }
    }

    /// Build a source from the in-cluster service account environment.
    pub fn in_cluster() -> Result<Self, CcmError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| CcmError::Internal("KUBERNETES_SERVICE_HOST not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|_| CcmError::Internal("KUBERNETES_SERVICE_PORT not set".into()))?;
        // IPv6 service hosts need brackets inside a URL.
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let sa_dir = Path::new(SERVICE_ACCOUNT_DIR);
        let ca = std::fs::read(sa_dir.join("ca.crt"))
            .map_err(|e| CcmError::Internal(format!("read service account CA: {e}")))?;
        let ca = Certificate::from_pem(&ca).map_err(CcmError::internal)?;
        let client = Client::builder()
            .add_root_certificate(ca)
            .build()
            .map_err(CcmError::internal)?;

        Ok(Self::new(
            client,
            format!("https://{host}:{port}"),
            Some(sa_dir.join("token")),
        ))
    }

    /// `name` must already have passed [`is_object_name`].
    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/apis/{API_GROUP}/{API_VERSION}/clusterconfigmaps/{name}",
            self.base_url
        )
    }

    async fn bearer_token(&self) -> Result<Option<String>, CcmError> {
        let Some(path) = &self.token_path else {
            return Ok(None);
        };
        let token = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CcmError::Internal(format!("read {}: {e}", path.display())))?;
        Ok(Some(token.trim().to_owned()))
    }
}

/// Whether `name` is a DNS-1123 subdomain, the only form a cluster-scoped
/// object name can take.  Anything else would change the request path.
fn is_object_name(name: &str) -> bool {
    let alnum = |c: u8| c.is_ascii_lowercase() || c.is_ascii_digit();
    !name.is_empty()
        && name.len() <= MAX_OBJECT_NAME_LEN
        && name.split('.').all(|label| {
            let bytes = label.as_bytes();
            match (bytes.first(), bytes.last()) {
                (Some(&first), Some(&last)) => {
                    alnum(first) && alnum(last) && bytes.iter().all(|&c| alnum(c) || c == b'-')
                }
                _ => false,
            }
        })
}

#[async_trait]
impl ConfigSource for KubeConfigSource {
    #[instrument(skip(self))]
    async fn fetch_by_name(&self, name: &str) -> Result<Bundle, CcmError> {
        let fetch_err = |reason: String| CcmError::SourceFetch {
            name: name.to_owned(),
            reason,
        };

        if !is_object_name(name) {
            return Err(fetch_err("not a valid object name".into()));
        }
        let url = self.object_url(name);
        debug!(%url, "querying cluster config map");

        let mut request = self.client.get(&url).header("Accept", "application/json");
        if let Some(token) = self.bearer_token().await? {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| fetch_err(format!("request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(CcmError::SourceNotFound(name.to_owned())),
            status if !status.is_success() => {
                return Err(fetch_err(format!("API server returned {status}")));
            }
            _ => {}
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| fetch_err(format!("read body: {e}")))?;
        let object: ClusterConfigMap =
            serde_json::from_slice(&body).map_err(|e| fetch_err(format!("decode: {e}")))?;
        Ok(object.data.unwrap_or_default())
    }
}
