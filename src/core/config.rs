use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BootError, BootResult};
use crate::poll::PollPolicy;

pub const ENV_MODULE_URL: &str = "WASMBOOT_MODULE_URL";
pub const ENV_BASE_URL: &str = "WASMBOOT_BASE_URL";

/// Size of one linear-memory page.
pub const PAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimits {
    /// 64 KiB pages.
    pub initial_pages: u32,
    pub maximum_pages: u32,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            initial_pages: 10,
            maximum_pages: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLimits {
    pub initial: u32,
    pub maximum: u32,
}

impl Default for TableLimits {
    fn default() -> Self {
        Self {
            initial: 0,
            maximum: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Namespace holding memory, table and raw helpers. Unknown names here
    /// are fatal.
    pub core_namespace: String,
    /// Namespaces whose unknown names fall back to a logged no-op.
    pub bindings_namespaces: Vec<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            core_namespace: "env".to_string(),
            bindings_namespaces: vec!["wbg".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Suffix of the module URL that gets swapped for `script_suffix`.
    pub module_suffix: String,
    pub script_suffix: String,
    pub poll: PollPolicy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            module_suffix: "_bg.wasm".to_string(),
            script_suffix: ".js".to_string(),
            poll: PollPolicy::new(10, 500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Tried in order; the first one that loads wins.
    pub script_urls: Vec<String>,
    pub poll: PollPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            script_urls: vec!["https://cdn.tauri.app/2.0.0/tauri.iife.js".to_string()],
            poll: PollPolicy::new(10, 200),
        }
    }
}

/// Everything a bootstrap attempt needs to know up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Origin that relative URLs are resolved against.
    pub base_url: Option<String>,
    pub module_url: String,
    pub fallback_urls: Vec<String>,
    pub request_timeout_ms: u64,
    pub memory: MemoryLimits,
    pub table: TableLimits,
    pub imports: ImportConfig,
    /// Export invoked once after a successful instantiation, if present.
    pub entry_point: Option<String>,
    pub recovery: RecoveryConfig,
    pub bridge: BridgeConfig,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            module_url: "/dist/beep-ui_bg.wasm".to_string(),
            fallback_urls: vec![
                "/dist/beep-ui_bg.wasm".to_string(),
                "/beep-ui_bg.wasm".to_string(),
                "/src/beep-ui_bg.wasm".to_string(),
            ],
            request_timeout_ms: 30_000,
            memory: MemoryLimits::default(),
            table: TableLimits::default(),
            imports: ImportConfig::default(),
            entry_point: Some("start".to_string()),
            recovery: RecoveryConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl BootConfig {
    pub fn with_module_url(mut self, url: impl Into<String>) -> Self {
        self.module_url = url.into();
        self
    }

    pub fn with_fallbacks<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base_url = Some(base.into());
        self
    }

    pub fn from_json_str(json: &str) -> BootResult<Self> {
        let cfg: BootConfig = serde_json::from_str(json)
            .map_err(|e| BootError::Config(format!("parse error: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> BootResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| BootError::Config(format!("failed to read {:?}: {}", path, e)))?;
        let cfg = Self::from_json_str(&json)?;
        info!("Loaded bootstrap config from {:?}", path);
        Ok(cfg)
    }

    pub fn to_json_pretty(&self) -> BootResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| BootError::Config(format!("serialize error: {}", e)))
    }

    /// Applies `WASMBOOT_MODULE_URL` / `WASMBOOT_BASE_URL` when set.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup(ENV_MODULE_URL) {
            let v = v.trim();
            if v.is_empty() {
                warn!("Ignoring empty {}", ENV_MODULE_URL);
            } else {
                info!("Module URL overridden by {}: {}", ENV_MODULE_URL, v);
                self.module_url = v.to_string();
            }
        }
        if let Some(v) = lookup(ENV_BASE_URL) {
            let v = v.trim();
            self.base_url = (!v.is_empty()).then(|| v.to_string());
        }
    }

    pub fn validate(&self) -> BootResult<()> {
        if self.module_url.trim().is_empty() {
            return Err(BootError::Config("module_url is empty".to_string()));
        }
        if self.memory.initial_pages > self.memory.maximum_pages {
            return Err(BootError::Config(format!(
                "memory initial_pages {} exceeds maximum_pages {}",
                self.memory.initial_pages, self.memory.maximum_pages
            )));
        }
        // 4 GiB of 64 KiB pages.
        if self.memory.maximum_pages > 65_536 {
            return Err(BootError::Config(format!(
                "memory maximum_pages {} exceeds the 32-bit address space",
                self.memory.maximum_pages
            )));
        }
        if self.table.initial > self.table.maximum {
            return Err(BootError::Config(format!(
                "table initial {} exceeds maximum {}",
                self.table.initial, self.table.maximum
            )));
        }
        if self.imports.core_namespace.is_empty() {
            return Err(BootError::Config("imports.core_namespace is empty".to_string()));
        }
        if self
            .imports
            .bindings_namespaces
            .iter()
            .any(|ns| *ns == self.imports.core_namespace)
        {
            return Err(BootError::Config(format!(
                "{} cannot be both the core and a bindings namespace",
                self.imports.core_namespace
            )));
        }
        if self.recovery.module_suffix.is_empty() {
            return Err(BootError::Config("recovery.module_suffix is empty".to_string()));
        }
        if self.recovery.poll.attempts == 0 || self.bridge.poll.attempts == 0 {
            return Err(BootError::Config("poll attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Primary URL first, then fallbacks, without repeats.
    pub fn candidate_urls(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(1 + self.fallback_urls.len());
        for url in std::iter::once(&self.module_url).chain(self.fallback_urls.iter()) {
            if !out.iter().any(|u| u == url) {
                out.push(url.clone());
            }
        }
        out
    }
}
