/// Configuration for submission flows
///
/// Layered the usual way:
/// 1. Defaults (the built-in form flows)
/// 2. Config file (portal-submit.toml)
/// 3. Environment variables (PORTAL_SUBMIT_* prefix)
///
/// # Example
///
/// ```no_run
/// use portal_submit::config::ConfigLoader;
///
/// let config = ConfigLoader::load_default().expect("Failed to load config");
/// let permit = config.policy("permit").expect("permit flow");
/// ```
pub mod error;
pub mod loader;

pub use error::{ConfigError, Result};
pub use loader::{AppConfig, ConfigLoader, FlowConfig, HttpConfig, MonitorConfig};
