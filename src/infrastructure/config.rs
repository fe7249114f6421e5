use crate::infrastructure::error::EngineError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const ENGINE_JSON: &str = "engine.json";
const SUPPORTED_SCHEMA: u8 = 1;

const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_AUTHORIZATION_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8080/oauth2/callback";
const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/calendar";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub schema: u8,
    pub timezone: String,
    #[serde(default)]
    pub expansion: ExpansionSettings,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExpansionSettings {
    pub interval_minutes: u64,
    pub look_ahead_days: i64,
    pub max_occurrences_per_run: usize,
    pub parallel_owners: usize,
}

impl Default for ExpansionSettings {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            look_ahead_days: 30,
            max_occurrences_per_run: 500,
            parallel_owners: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub calendar_id: String,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub token_refresh_margin_seconds: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            calendar_id: "primary".to_string(),
            retry_max_attempts: 3,
            retry_base_delay_ms: 200,
            token_refresh_margin_seconds: 300,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema: SUPPORTED_SCHEMA,
            timezone: "UTC".to_string(),
            expansion: ExpansionSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn time_zone(&self) -> Result<Tz, EngineError> {
        self.timezone.trim().parse::<Tz>().map_err(|error| {
            EngineError::InvalidConfig(format!("invalid timezone '{}': {error}", self.timezone))
        })
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.schema != SUPPORTED_SCHEMA {
            return Err(EngineError::InvalidConfig(format!(
                "unsupported schema {}",
                self.schema
            )));
        }
        self.time_zone()?;
        if self.expansion.interval_minutes == 0 {
            return Err(EngineError::InvalidConfig(
                "expansion.intervalMinutes must be >= 1".to_string(),
            ));
        }
        if self.expansion.look_ahead_days < 0 {
            return Err(EngineError::InvalidConfig(
                "expansion.lookAheadDays must be >= 0".to_string(),
            ));
        }
        if self.expansion.max_occurrences_per_run == 0 || self.expansion.parallel_owners == 0 {
            return Err(EngineError::InvalidConfig(
                "expansion.maxOccurrencesPerRun and expansion.parallelOwners must be >= 1"
                    .to_string(),
            ));
        }
        if self.sync.calendar_id.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "sync.calendarId must not be empty".to_string(),
            ));
        }
        if self.sync.retry_max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "sync.retryMaxAttempts must be >= 1".to_string(),
            ));
        }
        if self.sync.token_refresh_margin_seconds < 0 {
            return Err(EngineError::InvalidConfig(
                "sync.tokenRefreshMarginSeconds must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), EngineError> {
    let path = config_dir.join(ENGINE_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&EngineConfig::default())?;
        fs::write(path, format!("{formatted}\n"))?;
    }
    Ok(())
}

pub fn load_config(config_dir: &Path) -> Result<EngineConfig, EngineError> {
    let path = config_dir.join(ENGINE_JSON);
    let raw = fs::read_to_string(&path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| EngineError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != u64::from(SUPPORTED_SCHEMA) {
        return Err(EngineError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }

    let config: EngineConfig = serde_json::from_value(parsed).map_err(|error| {
        EngineError::InvalidConfig(format!("invalid {}: {error}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub token_endpoint: String,
    pub authorization_endpoint: String,
}

impl OAuthConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            scopes,
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            authorization_endpoint: DEFAULT_AUTHORIZATION_ENDPOINT.to_string(),
        }
    }
}

pub fn load_oauth_config_from_env() -> Result<OAuthConfig, EngineError> {
    load_oauth_config_from_lookup(|key| std::env::var(key).ok())
}

pub fn load_oauth_config_from_lookup<F>(lookup: F) -> Result<OAuthConfig, EngineError>
where
    F: Fn(&str) -> Option<String>,
{
    let client_id = required_lookup_value(
        &lookup,
        &["CADENCE_GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_ID"],
        "google client id",
    )?;
    let client_secret = required_lookup_value(
        &lookup,
        &["CADENCE_GOOGLE_CLIENT_SECRET", "GOOGLE_CLIENT_SECRET"],
        "google client secret",
    )?;
    let redirect_uri = optional_lookup_value(
        &lookup,
        &["CADENCE_GOOGLE_REDIRECT_URI", "GOOGLE_REDIRECT_URI"],
    )
    .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string());
    let scopes = optional_lookup_value(&lookup, &["CADENCE_GOOGLE_SCOPES", "GOOGLE_SCOPES"])
        .map(|raw| parse_scope_list(&raw))
        .filter(|scopes| !scopes.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_SCOPE.to_string()]);

    Ok(OAuthConfig::new(
        client_id,
        client_secret,
        redirect_uri,
        scopes,
    ))
}

fn required_lookup_value<F>(
    lookup: &F,
    keys: &[&str],
    field_name: &str,
) -> Result<String, EngineError>
where
    F: Fn(&str) -> Option<String>,
{
    optional_lookup_value(lookup, keys).ok_or_else(|| {
        EngineError::InvalidConfig(format!(
            "missing {} (set one of: {})",
            field_name,
            keys.join(", ")
        ))
    })
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter()
        .filter_map(|key| lookup(key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn parse_scope_list(raw: &str) -> Vec<String> {
    raw.split([',', ' ', '\n', '\t'])
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
