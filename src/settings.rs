//! Resolution of runtime settings.
//!
//! Each setting is resolved from, in order of priority: an explicit
//! override (CLI flag), an environment variable, the `settings` table in
//! [`ConfigDb`], and finally a built-in default.

use std::time::Duration;

use crate::{
    config_db::ConfigDb,
    error::{Error, Result},
    model_manager::DEFAULT_MODEL_ID,
};

pub const KEY_MODEL: &str = "model";
pub const KEY_COLLECTION: &str = "collection";
pub const KEY_LLM_MODEL: &str = "llm_model";
pub const KEY_LLM_BASE_URL: &str = "llm_base_url";
pub const KEY_REQUEST_TIMEOUT: &str = "request_timeout_secs";

/// Keys accepted by `threadsearch config set`.
pub const KNOWN_KEYS: &[&str] = &[
    KEY_MODEL,
    KEY_COLLECTION,
    KEY_LLM_MODEL,
    KEY_LLM_BASE_URL,
    KEY_REQUEST_TIMEOUT,
];

pub const DEFAULT_COLLECTION: &str = "email_chunks";
pub const DEFAULT_LLM_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

pub const MODEL_ENV_VAR: &str = "THREADSEARCH_MODEL";
pub const LLM_MODEL_ENV_VAR: &str = "THREADSEARCH_LLM_MODEL";
pub const LLM_URL_ENV_VAR: &str = "THREADSEARCH_LLM_URL";
pub const API_KEY_ENV_VARS: &[&str] = &["THREADSEARCH_API_KEY", "OPENAI_API_KEY"];

/// Values supplied on the command line, taking precedence over everything.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub model: Option<String>,
    pub collection: Option<String>,
}

#[derive(Clone)]
pub struct Settings {
    pub model: String,
    pub collection: String,
    pub llm_model: String,
    pub llm_base_url: String,
    pub request_timeout: Duration,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("model", &self.model)
            .field("collection", &self.collection)
            .field("llm_model", &self.llm_model)
            .field("llm_base_url", &self.llm_base_url)
            .field("request_timeout", &self.request_timeout)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Settings {
    /// Resolve settings against the process environment.
    pub fn resolve(overrides: &Overrides, config_db: &ConfigDb) -> Result<Self> {
        Self::resolve_with(overrides, config_db, |name| {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        })
    }

    /// Resolve settings with an explicit environment lookup.
    pub fn resolve_with(
        overrides: &Overrides,
        config_db: &ConfigDb,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let model = match overrides.model.clone().or_else(|| env(MODEL_ENV_VAR)) {
            Some(model) => model,
            None => config_db.get_setting_or(KEY_MODEL, DEFAULT_MODEL_ID)?,
        };

        let collection = match overrides.collection.clone() {
            Some(collection) => collection,
            None => {
                config_db.get_setting_or(KEY_COLLECTION, DEFAULT_COLLECTION)?
            }
        };

        let llm_model = match env(LLM_MODEL_ENV_VAR) {
            Some(m) => m,
            None => config_db.get_setting_or(KEY_LLM_MODEL, DEFAULT_LLM_MODEL)?,
        };

        let llm_base_url = match env(LLM_URL_ENV_VAR) {
            Some(url) => url,
            None => config_db
                .get_setting_or(KEY_LLM_BASE_URL, DEFAULT_LLM_BASE_URL)?,
        };

        let request_timeout = match config_db.get_setting(KEY_REQUEST_TIMEOUT)? {
            Some(raw) => Duration::from_secs(parse_timeout(&raw)?),
            None => Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        };

        let api_key = API_KEY_ENV_VARS.iter().find_map(|name| env(name));

        Ok(Self {
            model,
            collection,
            llm_model,
            llm_base_url,
            request_timeout,
            api_key,
        })
    }
}

/// Validate a value before it is persisted with `config set`.
pub fn validate_setting(key: &str, value: &str) -> Result<()> {
    if !KNOWN_KEYS.contains(&key) {
        return Err(Error::Config(format!(
            "unknown setting '{key}' (expected one of: {})",
            KNOWN_KEYS.join(", ")
        )));
    }
    if value.trim().is_empty() {
        return Err(Error::Config(format!("setting '{key}' cannot be empty")));
    }
    if key == KEY_REQUEST_TIMEOUT {
        parse_timeout(value)?;
    }
    Ok(())
}

fn parse_timeout(raw: &str) -> Result<u64> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(Error::Config(format!(
            "{KEY_REQUEST_TIMEOUT} must be a positive integer, got '{raw}'"
        ))),
    }
}
