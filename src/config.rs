use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "usd";
const DEFAULT_PAYMENT_PROVIDER: &str = "sandbox";
const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;
// Stripe refuses Checkout Session expiries shorter than 30 minutes.
const MIN_SESSION_TTL_SECS: u64 = 1800;
const MAX_SESSION_TTL_SECS: u64 = 86_400;

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// ISO currency code sent to the payment provider
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,

    /// Externally reachable base URL of this service, used for provider redirects
    #[validate(custom = "validate_http_url")]
    pub public_base_url: String,

    /// Card payment provider: "sandbox" or "stripe"
    #[serde(default = "default_payment_provider")]
    #[validate(custom = "validate_payment_provider")]
    pub payment_provider: String,

    #[serde(default)]
    pub stripe_secret_key: Option<String>,

    #[serde(default = "default_stripe_api_base")]
    #[validate(custom = "validate_http_url")]
    pub stripe_api_base: String,

    /// Shared secret for provider webhook signatures
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    #[serde(default = "default_webhook_tolerance_secs")]
    pub payment_webhook_tolerance_secs: u64,

    /// Lifetime of a hosted payment session before it expires
    #[serde(default = "default_session_ttl_secs")]
    #[validate(custom = "validate_session_ttl")]
    pub payment_session_ttl_secs: u64,

    /// Interval of the stale payment session sweep; 0 disables it
    #[serde(default = "default_reconciliation_interval_secs")]
    pub reconciliation_interval_secs: u64,

    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl AppConfig {
    /// Creates a configuration with defaults for every optional knob
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            public_base_url: format!("http://{}:{}", host, port),
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            default_currency: default_currency(),
            payment_provider: default_payment_provider(),
            stripe_secret_key: None,
            stripe_api_base: default_stripe_api_base(),
            payment_webhook_secret: None,
            payment_webhook_tolerance_secs: default_webhook_tolerance_secs(),
            payment_session_ttl_secs: default_session_ttl_secs(),
            reconciliation_interval_secs: default_reconciliation_interval_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn uses_stripe(&self) -> bool {
        self.payment_provider.eq_ignore_ascii_case("stripe")
    }

    /// Address the provider redirects the browser to once a session ends
    pub fn checkout_return_url(&self) -> String {
        format!(
            "{}/api/v1/orders/checkout/return",
            self.public_base_url.trim_end_matches('/')
        )
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.uses_stripe()
            && self
                .stripe_secret_key
                .as_deref()
                .map_or(true, |k| k.trim().is_empty())
        {
            let mut err = ValidationError::new("stripe_secret_key_required");
            err.message =
                Some("Set APP__STRIPE_SECRET_KEY when payment_provider is stripe".into());
            errors.add("stripe_secret_key", err);
        }

        if !self.is_development()
            && self
                .payment_webhook_secret
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
        {
            let mut err = ValidationError::new("payment_webhook_secret_required");
            err.message = Some(
                "Set APP__PAYMENT_WEBHOOK_SECRET outside development so callbacks can be authenticated"
                    .into(),
            );
            errors.add("payment_webhook_secret", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_pool_bounds");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}
fn default_payment_provider() -> String {
    DEFAULT_PAYMENT_PROVIDER.to_string()
}
fn default_stripe_api_base() -> String {
    DEFAULT_STRIPE_API_BASE.to_string()
}
fn default_webhook_tolerance_secs() -> u64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}
fn default_session_ttl_secs() -> u64 {
    MIN_SESSION_TTL_SECS
}
fn default_reconciliation_interval_secs() -> u64 {
    300
}
fn default_event_channel_capacity() -> usize {
    1024
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_payment_provider(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "sandbox" | "stripe" => Ok(()),
        _ => {
            let mut err = ValidationError::new("payment_provider");
            err.message = Some("Must be one of: sandbox, stripe".into());
            Err(err)
        }
    }
}

fn validate_http_url(value: &str) -> Result<(), ValidationError> {
    match url::Url::parse(value) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => Ok(()),
        _ => {
            let mut err = ValidationError::new("url");
            err.message = Some("Must be an absolute http(s) URL".into());
            Err(err)
        }
    }
}

fn validate_session_ttl(ttl: u64) -> Result<(), ValidationError> {
    if !(MIN_SESSION_TTL_SECS..=MAX_SESSION_TTL_SECS).contains(&ttl) {
        let mut err = ValidationError::new("payment_session_ttl_secs");
        err.message = Some("payment_session_ttl_secs must be between 1800 and 86400".into());
        return Err(err);
    }
    Ok(())
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_checkout={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);
    let filter = EnvFilter::new(filter_directive);

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);
    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

fn load_config_from(dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    if !dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("public_base_url", format!("http://localhost:{}", DEFAULT_PORT))?
        .add_source(File::from(dir.join("default")).required(false))
        .add_source(File::from(dir.join(run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
