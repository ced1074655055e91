//! Loads the native-bridge script and waits for the bridge to come up.

use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BootError, BootResult, UrlFailure};
use crate::fetch::Fetcher;
use crate::poll::poll_until;
use crate::recovery::{looks_like_markup, ScriptExecutor};

/// Answers whether the bridge object is usable yet.
pub trait BridgeProbe: Send + Sync {
    fn is_ready(&self) -> bool;
}

impl<F> BridgeProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_ready(&self) -> bool {
        self()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStatus {
    /// Ready before any script was loaded.
    AlreadyReady,
    Loaded { url: String, attempt: u32 },
}

pub struct BridgeLoader<'a, F, S> {
    fetcher: &'a F,
    executor: &'a S,
    config: &'a BridgeConfig,
}

impl<'a, F: Fetcher, S: ScriptExecutor> BridgeLoader<'a, F, S> {
    pub fn new(fetcher: &'a F, executor: &'a S, config: &'a BridgeConfig) -> Self {
        Self {
            fetcher,
            executor,
            config,
        }
    }

    pub async fn load<P: BridgeProbe + ?Sized>(&self, probe: &P) -> BootResult<BridgeStatus> {
        if probe.is_ready() {
            debug!("Native bridge already present");
            return Ok(BridgeStatus::AlreadyReady);
        }

        let url = self.load_script().await?;

        let policy = self.config.poll;
        let attempt = poll_until(policy, |n| probe.is_ready().then_some(n))
            .await
            .map_err(|exhausted| {
                error!("Native bridge not ready after {:?}", policy.budget());
                BootError::BridgeTimeout {
                    attempts: exhausted.attempts,
                    interval_ms: policy.interval_ms,
                }
            })?;
        info!("Native bridge ready after {} checks", attempt);
        Ok(BridgeStatus::Loaded { url, attempt })
    }

    /// First URL that fetches and executes cleanly wins.
    async fn load_script(&self) -> BootResult<String> {
        let mut failures = Vec::new();
        for url in &self.config.script_urls {
            match self.try_script(url).await {
                Ok(()) => {
                    info!("Native bridge script loaded from {}", url);
                    return Ok(url.clone());
                }
                Err(error) => {
                    warn!("Bridge script {} failed: {}", url, error);
                    failures.push(UrlFailure {
                        url: url.clone(),
                        error,
                    });
                }
            }
        }
        error!("No native bridge script could be loaded");
        Err(BootError::BridgeUnavailable { failures })
    }

    async fn try_script(&self, url: &str) -> BootResult<()> {
        let payload = self.fetcher.fetch(url).await?;
        let text = payload.text();
        if looks_like_markup(&text) {
            return Err(BootError::Script {
                url: url.to_string(),
                reason: "body looks like HTML".to_string(),
            });
        }
        self.executor
            .execute(&text)
            .map_err(|reason| BootError::Script {
                url: url.to_string(),
                reason,
            })
    }
}
