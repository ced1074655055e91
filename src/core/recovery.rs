//! What happens when the module URL answers with a web page.
//!
//! Dev servers and SPA fallbacks commonly serve `index.html` for a missing
//! `_bg.wasm`. The generated companion script next to it knows how to load
//! the module itself, so it is fetched, vetted and handed to the
//! [`ScriptExecutor`]; the registry is then watched for the result.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::RecoveryConfig;
use crate::error::{BootError, BootResult};
use crate::fetch::Fetcher;
use crate::instance::ModuleInstance;
use crate::poll::poll_until;
use crate::registry::ModuleRegistry;

/// Runs script text in whatever environment hosts the bootstrap.
///
/// Implementations may publish into the registry or leave an initializer
/// behind; both are picked up afterwards.
pub trait ScriptExecutor: Send + Sync {
    fn execute(&self, source: &str) -> Result<(), String>;
}

/// Swaps the last occurrence of the module suffix for the script suffix.
pub fn companion_url(module_url: &str, config: &RecoveryConfig) -> BootResult<String> {
    let idx = module_url
        .rfind(&config.module_suffix)
        .ok_or_else(|| BootError::Script {
            url: module_url.to_string(),
            reason: format!("no {:?} suffix to derive a script URL from", config.module_suffix),
        })?;
    let mut url = String::with_capacity(module_url.len() + config.script_suffix.len());
    url.push_str(&module_url[..idx]);
    url.push_str(&config.script_suffix);
    url.push_str(&module_url[idx + config.module_suffix.len()..]);
    Ok(url)
}

pub fn is_script_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.to_ascii_lowercase())
        .is_some_and(|ct| ct.contains("javascript") || ct.contains("ecmascript"))
}

/// True for text shaped like an HTML document rather than a script.
pub fn looks_like_markup(text: &str) -> bool {
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with('<') {
        return true;
    }
    let lower = text.to_ascii_lowercase();
    ["<!doctype", "<html", "<head", "<body", "</script"]
        .iter()
        .any(|tag| lower.contains(tag))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveredBy {
    /// The script published the instance while it ran.
    Script,
    /// The script left an initializer that produced the instance.
    Initializer,
    /// The instance showed up during polling.
    Polling { attempt: u32 },
}

pub struct RecoveryPath<'a, F, S> {
    fetcher: &'a F,
    executor: &'a S,
    registry: &'a ModuleRegistry,
    config: &'a RecoveryConfig,
}

impl<'a, F: Fetcher, S: ScriptExecutor> RecoveryPath<'a, F, S> {
    pub fn new(
        fetcher: &'a F,
        executor: &'a S,
        registry: &'a ModuleRegistry,
        config: &'a RecoveryConfig,
    ) -> Self {
        Self {
            fetcher,
            executor,
            registry,
            config,
        }
    }

    /// Runs once; a failure here is final.
    pub async fn run(&self, module_url: &str) -> BootResult<(Arc<ModuleInstance>, RecoveredBy)> {
        let script_url = companion_url(module_url, self.config)?;
        info!("Recovering via companion script {}", script_url);

        let source = self.load_script(&script_url).await?;
        self.executor.execute(&source).map_err(|reason| {
            error!("Companion script {} failed: {}", script_url, reason);
            BootError::Script {
                url: script_url.clone(),
                reason,
            }
        })?;
        debug!("Companion script {} executed", script_url);

        if let Some(inst) = self.registry.get() {
            info!("Module published by companion script");
            return Ok((inst, RecoveredBy::Script));
        }

        if let Some(init) = self.registry.take_initializer() {
            info!("Invoking initializer exposed by companion script");
            match init() {
                Ok(Some(instance)) => {
                    let inst = match self.registry.publish(instance) {
                        Ok(inst) => inst,
                        // Published concurrently; keep what is there.
                        Err(BootError::AlreadyInitialized) => match self.registry.get() {
                            Some(inst) => inst,
                            None => return Err(BootError::AlreadyInitialized),
                        },
                        Err(e) => return Err(e),
                    };
                    return Ok((inst, RecoveredBy::Initializer));
                }
                Ok(None) => warn!("Initializer returned no module; polling"),
                Err(e) => warn!("Initializer failed: {}; polling", e),
            }
        }

        let policy = self.config.poll;
        poll_until(policy, |attempt| {
            debug!("Waiting for module ({}/{})", attempt, policy.attempts);
            self.registry.get().map(|inst| (inst, RecoveredBy::Polling { attempt }))
        })
        .await
        .map_err(|exhausted| {
            error!(
                "Companion script {} did not publish a module within {:?}",
                script_url,
                policy.budget()
            );
            BootError::RecoveryTimeout {
                url: script_url.clone(),
                attempts: exhausted.attempts,
                interval_ms: policy.interval_ms,
            }
        })
    }

    async fn load_script(&self, url: &str) -> BootResult<String> {
        let payload = self.fetcher.fetch(url).await.map_err(|e| BootError::Script {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !is_script_content_type(payload.content_type.as_deref()) {
            return Err(BootError::Script {
                url: url.to_string(),
                reason: format!("content-type {:?} is not a script type", payload.content_type),
            });
        }
        let text = payload.text();
        if looks_like_markup(&text) {
            return Err(BootError::Script {
                url: url.to_string(),
                reason: "body looks like HTML".to_string(),
            });
        }
        debug!("Loaded script {} ({} bytes)", url, payload.len());
        Ok(text)
    }
}
