use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub policy: PolicyFileConfig,
    pub recovery: RecoveryConfig,
    pub realtime: RealtimeConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub api_base_url: String,
    pub auth_token: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Default)]
pub struct PolicyFileConfig {
    /// YAML policy document replacing the embedded default at startup.
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub enabled: bool,
    pub url: String,
    pub path: String,
    pub service_id: Option<String>,
    pub auth_token: Option<SecretString>,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub reconnect_delay_max_ms: u64,
    pub multi_tab: bool,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub api_base_url: Option<String>,
    pub log_level: Option<String>,
    pub realtime_enabled: Option<bool>,
    pub realtime_service_id: Option<String>,
    pub health_check_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                api_base_url: "http://localhost:8000/api/v1".to_string(),
                auth_token: None,
                timeout_secs: 30,
            },
            policy: PolicyFileConfig::default(),
            recovery: RecoveryConfig {
                enabled: true,
                max_retries: 3,
                initial_delay_ms: 1_000,
                max_delay_ms: 10_000,
                backoff_multiplier: 2.0,
                jitter: true,
            },
            realtime: RealtimeConfig {
                enabled: false,
                url: "ws://localhost:8000".to_string(),
                path: "/realtime".to_string(),
                service_id: None,
                auth_token: None,
                max_reconnect_attempts: 5,
                reconnect_delay_ms: 1_000,
                reconnect_delay_max_ms: 5_000,
                multi_tab: true,
            },
            server: ServerConfig { bind_address: "127.0.0.1".to_string(), health_check_port: 8080 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("blueprint.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(backend) = patch.backend {
            if let Some(api_base_url) = backend.api_base_url {
                self.backend.api_base_url = api_base_url;
            }
            if let Some(auth_token) = backend.auth_token {
                self.backend.auth_token = Some(secret_value(auth_token));
            }
            if let Some(timeout_secs) = backend.timeout_secs {
                self.backend.timeout_secs = timeout_secs;
            }
        }

        if let Some(policy) = patch.policy {
            if let Some(path) = policy.path {
                self.policy.path = Some(path);
            }
        }

        if let Some(recovery) = patch.recovery {
            if let Some(enabled) = recovery.enabled {
                self.recovery.enabled = enabled;
            }
            if let Some(max_retries) = recovery.max_retries {
                self.recovery.max_retries = max_retries;
            }
            if let Some(initial_delay_ms) = recovery.initial_delay_ms {
                self.recovery.initial_delay_ms = initial_delay_ms;
            }
            if let Some(max_delay_ms) = recovery.max_delay_ms {
                self.recovery.max_delay_ms = max_delay_ms;
            }
            if let Some(backoff_multiplier) = recovery.backoff_multiplier {
                self.recovery.backoff_multiplier = backoff_multiplier;
            }
            if let Some(jitter) = recovery.jitter {
                self.recovery.jitter = jitter;
            }
        }

        if let Some(realtime) = patch.realtime {
            if let Some(enabled) = realtime.enabled {
                self.realtime.enabled = enabled;
            }
            if let Some(url) = realtime.url {
                self.realtime.url = url;
            }
            if let Some(path) = realtime.path {
                self.realtime.path = path;
            }
            if let Some(service_id) = realtime.service_id {
                self.realtime.service_id = Some(service_id);
            }
            if let Some(auth_token) = realtime.auth_token {
                self.realtime.auth_token = Some(secret_value(auth_token));
            }
            if let Some(max_reconnect_attempts) = realtime.max_reconnect_attempts {
                self.realtime.max_reconnect_attempts = max_reconnect_attempts;
            }
            if let Some(reconnect_delay_ms) = realtime.reconnect_delay_ms {
                self.realtime.reconnect_delay_ms = reconnect_delay_ms;
            }
            if let Some(reconnect_delay_max_ms) = realtime.reconnect_delay_max_ms {
                self.realtime.reconnect_delay_max_ms = reconnect_delay_max_ms;
            }
            if let Some(multi_tab) = realtime.multi_tab {
                self.realtime.multi_tab = multi_tab;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("BLUEPRINT_BACKEND_API_BASE_URL") {
            self.backend.api_base_url = value;
        }
        if let Some(value) = read_env("BLUEPRINT_BACKEND_AUTH_TOKEN") {
            self.backend.auth_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("BLUEPRINT_BACKEND_TIMEOUT_SECS") {
            self.backend.timeout_secs = parse_u64("BLUEPRINT_BACKEND_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("BLUEPRINT_POLICY_PATH") {
            self.policy.path = Some(PathBuf::from(value));
        }

        if let Some(value) = read_env("BLUEPRINT_RECOVERY_ENABLED") {
            self.recovery.enabled = parse_bool("BLUEPRINT_RECOVERY_ENABLED", &value)?;
        }
        if let Some(value) = read_env("BLUEPRINT_RECOVERY_MAX_RETRIES") {
            self.recovery.max_retries = parse_u32("BLUEPRINT_RECOVERY_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("BLUEPRINT_RECOVERY_INITIAL_DELAY_MS") {
            self.recovery.initial_delay_ms =
                parse_u64("BLUEPRINT_RECOVERY_INITIAL_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("BLUEPRINT_RECOVERY_MAX_DELAY_MS") {
            self.recovery.max_delay_ms = parse_u64("BLUEPRINT_RECOVERY_MAX_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("BLUEPRINT_RECOVERY_BACKOFF_MULTIPLIER") {
            self.recovery.backoff_multiplier =
                parse_f64("BLUEPRINT_RECOVERY_BACKOFF_MULTIPLIER", &value)?;
        }
        if let Some(value) = read_env("BLUEPRINT_RECOVERY_JITTER") {
            self.recovery.jitter = parse_bool("BLUEPRINT_RECOVERY_JITTER", &value)?;
        }

        if let Some(value) = read_env("BLUEPRINT_REALTIME_ENABLED") {
            self.realtime.enabled = parse_bool("BLUEPRINT_REALTIME_ENABLED", &value)?;
        }
        if let Some(value) = read_env("BLUEPRINT_REALTIME_URL") {
            self.realtime.url = value;
        }
        if let Some(value) = read_env("BLUEPRINT_REALTIME_PATH") {
            self.realtime.path = value;
        }
        if let Some(value) = read_env("BLUEPRINT_REALTIME_SERVICE_ID") {
            self.realtime.service_id = Some(value);
        }
        if let Some(value) = read_env("BLUEPRINT_REALTIME_AUTH_TOKEN") {
            self.realtime.auth_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("BLUEPRINT_REALTIME_MAX_RECONNECT_ATTEMPTS") {
            self.realtime.max_reconnect_attempts =
                parse_u32("BLUEPRINT_REALTIME_MAX_RECONNECT_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("BLUEPRINT_REALTIME_RECONNECT_DELAY_MS") {
            self.realtime.reconnect_delay_ms =
                parse_u64("BLUEPRINT_REALTIME_RECONNECT_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("BLUEPRINT_REALTIME_RECONNECT_DELAY_MAX_MS") {
            self.realtime.reconnect_delay_max_ms =
                parse_u64("BLUEPRINT_REALTIME_RECONNECT_DELAY_MAX_MS", &value)?;
        }
        if let Some(value) = read_env("BLUEPRINT_REALTIME_MULTI_TAB") {
            self.realtime.multi_tab = parse_bool("BLUEPRINT_REALTIME_MULTI_TAB", &value)?;
        }

        if let Some(value) = read_env("BLUEPRINT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("BLUEPRINT_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("BLUEPRINT_SERVER_HEALTH_CHECK_PORT", &value)?;
        }

        if let Some(value) = read_env("BLUEPRINT_LOGGING_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = read_env("BLUEPRINT_LOGGING_FORMAT") {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(api_base_url) = overrides.api_base_url {
            self.backend.api_base_url = api_base_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(enabled) = overrides.realtime_enabled {
            self.realtime.enabled = enabled;
        }
        if let Some(service_id) = overrides.realtime_service_id {
            self.realtime.service_id = Some(service_id);
        }
        if let Some(port) = overrides.health_check_port {
            self.server.health_check_port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_backend(&self.backend)?;
        validate_recovery(&self.recovery)?;
        validate_realtime(&self.realtime)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

impl RealtimeConfig {
    /// Full handshake endpoint, `url` joined with the fixed event path.
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), self.path.trim_start_matches('/'))
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("blueprint.toml"), PathBuf::from("config/blueprint.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_backend(backend: &BackendConfig) -> Result<(), ConfigError> {
    let url = backend.api_base_url.trim();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "backend.api_base_url must start with http:// or https://".to_string(),
        ));
    }

    if backend.timeout_secs == 0 || backend.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "backend.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if let Some(token) = &backend.auth_token {
        if token.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "backend.auth_token must not be blank when set".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_recovery(recovery: &RecoveryConfig) -> Result<(), ConfigError> {
    if recovery.max_retries > 10 {
        return Err(ConfigError::Validation(
            "recovery.max_retries must be in range 0..=10".to_string(),
        ));
    }

    if recovery.max_delay_ms < recovery.initial_delay_ms {
        return Err(ConfigError::Validation(
            "recovery.max_delay_ms must be greater than or equal to recovery.initial_delay_ms"
                .to_string(),
        ));
    }

    if !recovery.backoff_multiplier.is_finite() || recovery.backoff_multiplier < 1.0 {
        return Err(ConfigError::Validation(
            "recovery.backoff_multiplier must be a finite number >= 1.0".to_string(),
        ));
    }

    Ok(())
}

fn validate_realtime(realtime: &RealtimeConfig) -> Result<(), ConfigError> {
    let url = realtime.url.trim();
    let supported = ["ws://", "wss://", "http://", "https://", "memory://"];
    if !supported.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(ConfigError::Validation(
            "realtime.url must start with ws://, wss://, http://, https:// or memory://"
                .to_string(),
        ));
    }

    if !realtime.path.starts_with('/') {
        return Err(ConfigError::Validation("realtime.path must start with `/`".to_string()));
    }

    if realtime.reconnect_delay_max_ms < realtime.reconnect_delay_ms {
        return Err(ConfigError::Validation(
            "realtime.reconnect_delay_max_ms must be greater than or equal to realtime.reconnect_delay_ms"
                .to_string(),
        ));
    }

    if realtime.enabled {
        let missing_service =
            realtime.service_id.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
        if missing_service {
            return Err(ConfigError::Validation(
                "realtime.service_id is required when realtime.enabled is true".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    backend: Option<BackendPatch>,
    policy: Option<PolicyPatch>,
    recovery: Option<RecoveryPatch>,
    realtime: Option<RealtimePatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendPatch {
    api_base_url: Option<String>,
    auth_token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyPatch {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RecoveryPatch {
    enabled: Option<bool>,
    max_retries: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    jitter: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RealtimePatch {
    enabled: Option<bool>,
    url: Option<String>,
    path: Option<String>,
    service_id: Option<String>,
    auth_token: Option<String>,
    max_reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    reconnect_delay_max_ms: Option<u64>,
    multi_tab: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
