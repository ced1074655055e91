//! The orchestrator: walks candidate URLs, routes the first usable payload,
//! publishes the instance and runs the entry point.
//!
//! The primary URL's payload is routed whatever it is: a module is
//! instantiated, an HTML page starts recovery, anything else is a format
//! error. Fallback URLs only count when they deliver a binary module.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeLoader, BridgeProbe, BridgeStatus};
use crate::config::BootConfig;
use crate::error::{BootError, BootResult, UrlFailure};
use crate::fetch::{Fetcher, Payload};
use crate::format::{classify, content_type_advisory, is_valid_binary_module, PayloadKind};
use crate::instance::{Instantiator, ModuleInstance};
use crate::recovery::{RecoveredBy, RecoveryPath, ScriptExecutor};
use crate::registry::{Claim, InitClaim, ModuleRegistry};

/// Bytes of header included in diagnostics.
const HEADER_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootRoute {
    Instantiated,
    Recovered(RecoveredBy),
    /// The registry already held an instance; nothing was fetched.
    AlreadyInitialized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPointOutcome {
    /// No entry point configured, not exported, or not our instantiation.
    Absent,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct BootReport {
    /// URL whose payload was used; `None` on a short-circuit.
    pub url: Option<String>,
    pub route: BootRoute,
    pub instance: Arc<ModuleInstance>,
    pub entry_point: EntryPointOutcome,
}

#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub bridge: BridgeStatus,
    pub boot: BootReport,
}

pub struct Bootstrap<F, S> {
    config: BootConfig,
    fetcher: F,
    executor: S,
    registry: ModuleRegistry,
    instantiator: Instantiator,
}

#[cfg(feature = "http")]
impl<S: ScriptExecutor> Bootstrap<crate::fetch::HttpFetcher, S> {
    /// Fetches over HTTP using the configured base URL and timeout.
    pub fn http(config: BootConfig, executor: S) -> BootResult<Self> {
        let fetcher = crate::fetch::HttpFetcher::from_config(&config)?;
        Self::new(config, fetcher, executor)
    }
}

impl<F: Fetcher, S: ScriptExecutor> Bootstrap<F, S> {
    pub fn new(config: BootConfig, fetcher: F, executor: S) -> BootResult<Self> {
        config.validate()?;
        let instantiator = Instantiator::new(&config);
        Ok(Self {
            config,
            fetcher,
            executor,
            registry: ModuleRegistry::new(),
            instantiator,
        })
    }

    /// Shares an existing slot, e.g. with the script executor.
    pub fn with_registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_instantiator(mut self, instantiator: Instantiator) -> Self {
        self.instantiator = instantiator;
        self
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    pub fn instantiator_mut(&mut self) -> &mut Instantiator {
        &mut self.instantiator
    }

    /// Loads the native bridge, then bootstraps the module.
    pub async fn launch<P: BridgeProbe + ?Sized>(&self, probe: &P) -> BootResult<LaunchReport> {
        let bridge = BridgeLoader::new(&self.fetcher, &self.executor, &self.config.bridge)
            .load(probe)
            .await?;
        let boot = self.run().await?;
        Ok(LaunchReport { bridge, boot })
    }

    pub async fn run(&self) -> BootResult<BootReport> {
        let claim = match self.registry.try_claim() {
            Claim::Ready(instance) => {
                info!("Module already initialized; skipping bootstrap");
                return Ok(BootReport {
                    url: None,
                    route: BootRoute::AlreadyInitialized,
                    instance,
                    entry_point: EntryPointOutcome::Absent,
                });
            }
            Claim::InProgress => {
                warn!("Bootstrap requested while another attempt is running");
                return Err(BootError::InitializationInProgress);
            }
            Claim::Granted(claim) => claim,
        };

        let urls = self.config.candidate_urls();
        info!("Bootstrapping module ({} candidate URLs)", urls.len());

        let mut failures = Vec::new();
        for (i, url) in urls.into_iter().enumerate() {
            match self.fetcher.fetch(&url).await {
                Ok(payload) if i > 0 && !is_valid_binary_module(&payload.bytes) => {
                    let error = format_error(&payload);
                    warn!("Fallback {} did not deliver a module: {}", url, error);
                    failures.push(UrlFailure { url, error });
                }
                Ok(payload) => return self.route(claim, payload).await,
                Err(e) if e.is_fetch_failure() => {
                    warn!("Candidate {} unavailable: {}", url, e);
                    failures.push(UrlFailure { url, error: e });
                }
                Err(e) => {
                    error!("Fetching {} failed: {}", url, e);
                    return Err(e);
                }
            }
        }

        error!("All {} candidate URLs failed", failures.len());
        Err(BootError::FallbacksExhausted { failures })
    }

    async fn route(&self, claim: InitClaim, payload: Payload) -> BootResult<BootReport> {
        if let Some(ct) = content_type_advisory(payload.content_type.as_deref()) {
            warn!("{} served with unexpected content-type {}", payload.url, ct);
        }
        debug!(
            "{}: {} bytes, header {}",
            payload.url,
            payload.len(),
            payload.header(HEADER_BYTES)
        );

        match classify(&payload.bytes) {
            PayloadKind::BinaryModule => {
                let instance = match self.compile(&payload).await {
                    Ok(instance) => instance,
                    Err(e) => {
                        error!(
                            "Instantiating {} failed ({} bytes, status {}): {}",
                            payload.url,
                            payload.len(),
                            payload.status,
                            e
                        );
                        return Err(e);
                    }
                };
                let instance = claim.publish(instance)?;
                let entry_point = self.invoke_entry_point(&instance);
                Ok(BootReport {
                    url: Some(payload.url),
                    route: BootRoute::Instantiated,
                    instance,
                    entry_point,
                })
            }
            PayloadKind::Html => {
                warn!("{} returned an HTML page instead of a module", payload.url);
                let recovery = RecoveryPath::new(
                    &self.fetcher,
                    &self.executor,
                    &self.registry,
                    &self.config.recovery,
                );
                let (instance, by) = recovery.run(&payload.url).await?;
                drop(claim);
                Ok(BootReport {
                    url: Some(payload.url),
                    route: BootRoute::Recovered(by),
                    instance,
                    entry_point: EntryPointOutcome::Absent,
                })
            }
            PayloadKind::Unrecognized => {
                let err = format_error(&payload);
                error!("{}", err);
                Err(err)
            }
        }
    }

    /// Compiles and instantiates on the blocking pool.
    async fn compile(&self, payload: &Payload) -> BootResult<ModuleInstance> {
        let instantiator = self.instantiator.clone();
        let bytes = payload.bytes.clone();
        tokio::task::spawn_blocking(move || instantiator.instantiate(&bytes))
            .await
            .map_err(|e| BootError::Instantiation {
                source: wasmtime::Error::new(e),
            })?
    }

    fn invoke_entry_point(&self, instance: &ModuleInstance) -> EntryPointOutcome {
        let Some(name) = self.config.entry_point.as_deref() else {
            return EntryPointOutcome::Absent;
        };
        if !instance.is_callable(name) {
            debug!("No `{}` export; skipping entry point", name);
            return EntryPointOutcome::Absent;
        }
        match instance.call(name, &[]) {
            Ok(_) => {
                info!("Entry point `{}` returned", name);
                EntryPointOutcome::Succeeded
            }
            Err(e) => {
                // The instance stays published.
                error!("Entry point `{}` failed: {}", name, e);
                EntryPointOutcome::Failed(e.to_string())
            }
        }
    }
}

fn format_error(payload: &Payload) -> BootError {
    BootError::Format {
        url: payload.url.clone(),
        len: payload.len(),
        header: payload.header(HEADER_BYTES),
    }
}
