use crate::config::error::{ConfigError, Result};
use crate::quality::DEFAULT_SAMPLE_INTERVAL;
use crate::retry::{DelayMode, RetryPolicy};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up in the working directory and the user config dir.
pub const CONFIG_FILE_NAME: &str = "portal-submit.toml";

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Retry policies keyed by flow name ("permit", "equipment", "phone")
    #[serde(default)]
    pub flows: BTreeMap<String, FlowConfig>,

    /// Connection quality sampling
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Backend endpoint settings
    #[serde(default)]
    pub http: HttpConfig,
}

/// One flow's retry policy as written in the file.
///
/// The four core fields are required once all layers are merged; the
/// built-in flows supply them by default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplication_window_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_mode: Option<DelayMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_factor: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_interval_ms: Option<u64>,
}

impl FlowConfig {
    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self {
            timeout_ms: Some(policy.timeout_ms),
            max_retries: Some(policy.max_retries),
            retry_delay_ms: Some(policy.retry_delay_ms),
            deduplication_window_ms: Some(policy.deduplication_window_ms),
            delay_mode: Some(policy.delay_mode),
            jitter_factor: Some(policy.jitter_factor),
            min_interval_ms: policy.min_interval_ms,
        }
    }

    /// Resolve into a validated [`RetryPolicy`]. `flow` names the section in
    /// error messages.
    pub fn to_policy(&self, flow: &str) -> Result<RetryPolicy> {
        let required = |value: Option<u64>, field: &str| {
            value.ok_or_else(|| ConfigError::MissingField(format!("flows.{flow}.{field}")))
        };

        let mut policy = RetryPolicy::new(
            required(self.timeout_ms, "timeout_ms")?,
            self.max_retries
                .ok_or_else(|| ConfigError::MissingField(format!("flows.{flow}.max_retries")))?,
            required(self.retry_delay_ms, "retry_delay_ms")?,
            required(self.deduplication_window_ms, "deduplication_window_ms")?,
        );
        policy.delay_mode = self.delay_mode.unwrap_or_default();
        policy.jitter_factor = self.jitter_factor.unwrap_or(0.0);
        policy.min_interval_ms = self.min_interval_ms;

        policy
            .validate()
            .map_err(|msg| ConfigError::ValidationError(format!("flows.{flow}: {msg}")))?;
        Ok(policy)
    }
}

/// Connection quality sampling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Backend endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token sent with every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl HttpConfig {
    /// Absolute URL for an API path such as `/api/permit-request`.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn default_sample_interval_ms() -> u64 {
    DEFAULT_SAMPLE_INTERVAL.as_millis() as u64
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let flows = [
            ("permit", RetryPolicy::permit_request()),
            ("equipment", RetryPolicy::equipment_request()),
            ("phone", RetryPolicy::phone_update()),
        ]
        .into_iter()
        .map(|(name, policy)| (name.to_string(), FlowConfig::from_policy(&policy)))
        .collect();

        Self {
            flows,
            monitor: MonitorConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl AppConfig {
    /// Resolved retry policy for `flow`.
    pub fn policy(&self, flow: &str) -> Result<RetryPolicy> {
        self.flows
            .get(flow)
            .ok_or_else(|| ConfigError::MissingField(format!("flows.{flow}")))?
            .to_policy(flow)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, flow) in &self.flows {
            flow.to_policy(name)?;
        }
        if self.monitor.sample_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.sample_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.http.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "http.base_url must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loader with layered merging support
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration with layered merging:
    /// 1. Start with defaults (from Default implementations)
    /// 2. Merge config file if provided
    /// 3. Override with environment variables (PORTAL_SUBMIT_ prefix)
    pub fn load(&self) -> Result<AppConfig> {
        let mut builder = Config::builder();

        // Layer 1: Defaults (serialize defaults to JSON and load as base)
        let defaults_json = serde_json::to_string(&AppConfig::default())?;
        builder = builder.add_source(File::from_str(&defaults_json, config::FileFormat::Json));

        // Layer 2: Config file (if provided)
        if let Some(ref path) = self.config_path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            builder = builder.add_source(File::from(path.as_ref()));
        }

        // Layer 3: Environment variables, double underscore for nesting
        // Example: PORTAL_SUBMIT_FLOWS__PERMIT__TIMEOUT_MS=60000
        builder = builder.add_source(
            Environment::with_prefix("PORTAL_SUBMIT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let app_config: AppConfig = builder.build()?.try_deserialize()?;
        app_config.validate()?;

        tracing::debug!(
            path = ?self.config_path,
            flows = app_config.flows.len(),
            "configuration loaded"
        );
        Ok(app_config)
    }

    /// Locate the default config file:
    /// 1. Current directory: ./portal-submit.toml
    /// 2. XDG config: ~/.config/portal/portal-submit.toml
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from(".").join(CONFIG_FILE_NAME);
        if cwd_config.exists() {
            return Some(cwd_config);
        }

        dirs::config_dir()
            .map(|dir| dir.join("portal").join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<AppConfig> {
        let loader = match Self::find_config_file() {
            Some(config_path) => ConfigLoader::new().with_file(config_path),
            None => ConfigLoader::new(),
        };

        loader.load()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::env;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&config_path, content).expect("Failed to write temp file");
        (temp_dir, config_path)
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(
            config.policy("permit").unwrap(),
            RetryPolicy::permit_request()
        );
        assert_eq!(
            config.policy("equipment").unwrap(),
            RetryPolicy::equipment_request()
        );
        assert_eq!(config.policy("phone").unwrap(), RetryPolicy::phone_update());
        assert_eq!(config.monitor.sample_interval(), Duration::from_secs(5));
        assert_eq!(config.http.token, None);
    }

    #[test]
    #[serial]
    fn test_load_with_defaults_only() {
        let config = ConfigLoader::new()
            .load()
            .expect("Failed to load default config");
        assert_eq!(config.flows.len(), 3);
        assert_eq!(config.policy("phone").unwrap().max_retries, 2);
    }

    #[test]
    #[serial]
    fn test_load_with_toml_file() {
        let (_dir, path) = write_config(
            r#"
[flows.permit]
timeout_ms = 60000
delay_mode = "quality_scaled"

[flows.survey]
timeout_ms = 10000
max_retries = 1
retry_delay_ms = 500
deduplication_window_ms = 2000
min_interval_ms = 0

[http]
base_url = "https://portal.example.com/"
token = "secret"
"#,
        );

        let config = ConfigLoader::new().with_file(&path).load().unwrap();

        let permit = config.policy("permit").unwrap();
        assert_eq!(permit.timeout_ms, 60_000);
        assert_eq!(permit.max_retries, 3);
        assert_eq!(permit.delay_mode, DelayMode::QualityScaled);

        let survey = config.policy("survey").unwrap();
        assert_eq!(survey.base_min_interval(), Duration::ZERO);

        assert_eq!(
            config.http.endpoint("/api/permit-request"),
            "https://portal.example.com/api/permit-request"
        );
        assert_eq!(config.http.token.as_deref(), Some("secret"));
    }

    #[test]
    #[serial]
    fn test_layered_merging() {
        let (_dir, path) = write_config(
            r#"
[flows.phone]
timeout_ms = 20000
retry_delay_ms = 1000
"#,
        );

        unsafe {
            env::set_var("PORTAL_SUBMIT_FLOWS__PHONE__TIMEOUT_MS", "25000");
        }

        let result = ConfigLoader::new().with_file(&path).load();

        unsafe {
            env::remove_var("PORTAL_SUBMIT_FLOWS__PHONE__TIMEOUT_MS");
        }

        let phone = result.unwrap().policy("phone").unwrap();
        // Env var wins over file, file wins over defaults
        assert_eq!(phone.timeout_ms, 25_000);
        assert_eq!(phone.retry_delay_ms, 1_000);
        assert_eq!(phone.deduplication_window_ms, 5_000);
    }

    #[test]
    #[serial]
    fn test_incomplete_flow_reports_missing_field() {
        let (_dir, path) = write_config(
            r#"
[flows.survey]
timeout_ms = 10000
max_retries = 1
"#,
        );

        let err = ConfigLoader::new().with_file(&path).load().unwrap_err();
        match err {
            ConfigError::MissingField(field) => {
                assert_eq!(field, "flows.survey.retry_delay_ms")
            }
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_invalid_values_rejected() {
        let (_dir, path) = write_config(
            r#"
[flows.permit]
jitter_factor = 1.5
"#,
        );

        let err = ConfigLoader::new().with_file(&path).load().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
        assert!(err.to_string().contains("flows.permit"));
    }

    #[test]
    fn test_unknown_flow_is_missing() {
        let err = AppConfig::default().policy("survey").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(ref f) if f == "flows.survey"));
    }

    #[test]
    fn test_missing_file_error() {
        let result = ConfigLoader::new()
            .with_file("/nonexistent/portal-submit.toml")
            .load();
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }
}
