//! # wasmboot
//!
//! Bootstrap layer for a binary module (WebAssembly) front end: fetch the
//! module from an ordered list of URLs, check its magic number, resolve its
//! imports against a small compatibility shim and instantiate it. When a
//! server answers with an HTML page instead, the companion script is loaded
//! and trusted to initialize the module itself.
//!
//! ## Quick Start
//!
//! ```no_run
//! use wasmboot::prelude::*;
//!
//! struct NoScripts;
//!
//! impl ScriptExecutor for NoScripts {
//!     fn execute(&self, _source: &str) -> Result<(), String> {
//!         Err("script execution unavailable".to_string())
//!     }
//! }
//!
//! # async fn demo() -> BootResult<()> {
//! let config = BootConfig::default().with_base_url("http://localhost:1420");
//! let boot = Bootstrap::http(config, NoScripts)?;
//! let report = boot.run().await?;
//! println!("loaded from {:?} via {:?}", report.url, report.route);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `http` (default): [`fetch::HttpFetcher`] on top of `reqwest`
//!
//! ## Modules
//!
//! - [`format`]: magic number and HTML sniffing
//! - [`shim`]: host functions for the `env` and `wbg` namespaces
//! - [`instance`]: instantiation and the callable module surface
//! - [`registry`]: the single module slot
//! - [`recovery`]: companion script path for HTML responses
//! - [`bridge`]: native bridge loading
//! - [`bootstrap`]: the orchestrator

#[path = "core/error.rs"]
pub mod error;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/poll.rs"]
pub mod poll;

#[path = "core/format.rs"]
pub mod format;

#[path = "core/fetch.rs"]
pub mod fetch;

#[path = "core/shim.rs"]
pub mod shim;

#[path = "core/instance.rs"]
pub mod instance;

#[path = "core/registry.rs"]
pub mod registry;

#[path = "core/recovery.rs"]
pub mod recovery;

#[path = "core/bridge.rs"]
pub mod bridge;

#[path = "core/bootstrap.rs"]
pub mod bootstrap;

/// Prelude module for convenient imports.
///
/// ```
/// use wasmboot::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bootstrap::{BootReport, BootRoute, Bootstrap, EntryPointOutcome, LaunchReport};
    pub use crate::bridge::{BridgeLoader, BridgeProbe, BridgeStatus};
    pub use crate::config::{BootConfig, BridgeConfig, ImportConfig, MemoryLimits, RecoveryConfig, TableLimits};
    pub use crate::error::{BootError, BootResult, UrlFailure};
    #[cfg(feature = "http")]
    pub use crate::fetch::HttpFetcher;
    pub use crate::fetch::{Fetcher, Payload};
    pub use crate::format::{is_valid_binary_module, looks_like_html, PayloadKind};
    pub use crate::instance::{ExportInfo, ExportKind, Instantiator, ModuleInstance};
    pub use crate::poll::{poll_until, PollPolicy};
    pub use crate::recovery::{RecoveredBy, ScriptExecutor};
    pub use crate::registry::{Claim, ModuleRegistry};
    pub use crate::shim::{HostValue, ImportResolver, ImportShim, ShimError};
}
