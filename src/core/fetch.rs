//! Payload retrieval. One GET per call, no retries; the orchestrator walks
//! the fallback list.

use std::future::Future;

use crate::error::BootResult;
use crate::format::header_hex;

/// Bytes delivered by a successful (2xx) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Payload {
    pub fn new(url: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            status: 200,
            content_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// First `n` bytes as hex.
    pub fn header(&self, n: usize) -> String {
        header_hex(&self.bytes, n)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

pub trait Fetcher: Send + Sync {
    /// Fails with `Transport` for a non-2xx answer and `Network` when no
    /// answer arrived at all.
    fn fetch(&self, url: &str) -> impl Future<Output = BootResult<Payload>> + Send;
}

#[cfg(feature = "http")]
pub use self::http::HttpFetcher;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use reqwest::header::CONTENT_TYPE;
    use reqwest::Url;
    use tracing::{debug, info, warn};

    use super::{Fetcher, Payload};
    use crate::config::BootConfig;
    use crate::error::{BootError, BootResult};

    #[derive(Debug, Clone)]
    pub struct HttpFetcher {
        client: reqwest::Client,
        base_url: Option<Url>,
    }

    impl HttpFetcher {
        pub fn new(timeout: Duration, base_url: Option<&str>) -> BootResult<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .gzip(true)
                .build()
                .map_err(|e| BootError::Config(format!("http client: {}", e)))?;
            let base_url = base_url
                .map(|b| {
                    Url::parse(b).map_err(|e| BootError::Config(format!("base_url {:?}: {}", b, e)))
                })
                .transpose()?;
            Ok(Self { client, base_url })
        }

        pub fn from_config(config: &BootConfig) -> BootResult<Self> {
            Self::new(
                Duration::from_millis(config.request_timeout_ms),
                config.base_url.as_deref(),
            )
        }

        /// Absolute URLs pass through; relative ones need a base.
        pub fn resolve(&self, url: &str) -> BootResult<Url> {
            let joined = match &self.base_url {
                Some(base) => base.join(url),
                None => Url::parse(url),
            };
            joined.map_err(|e| BootError::Network {
                url: url.to_string(),
                reason: match &self.base_url {
                    Some(base) => format!("cannot resolve against {}: {}", base, e),
                    None => format!("{} (no base_url configured)", e),
                },
            })
        }
    }

    impl Fetcher for HttpFetcher {
        async fn fetch(&self, url: &str) -> BootResult<Payload> {
            let target = self.resolve(url)?;
            debug!("GET {}", target);

            let resp = self.client.get(target.clone()).send().await.map_err(|e| {
                warn!("Request to {} failed: {}", target, e);
                BootError::Network {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            })?;

            let status = resp.status();
            if !status.is_success() {
                warn!("{} answered {}", target, status);
                return Err(BootError::Transport {
                    url: url.to_string(),
                    status: status.as_u16(),
                    reason: status.canonical_reason().unwrap_or("").to_string(),
                });
            }

            let content_type = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let bytes = resp.bytes().await.map_err(|e| BootError::Network {
                url: url.to_string(),
                reason: format!("reading body: {}", e),
            })?;

            info!(
                "Fetched {} ({} bytes, status {}, content-type {:?})",
                target,
                bytes.len(),
                status.as_u16(),
                content_type
            );
            Ok(Payload {
                url: url.to_string(),
                status: status.as_u16(),
                content_type,
                bytes: bytes.to_vec(),
            })
        }
    }

}
