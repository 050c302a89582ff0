use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tally_core::remote::{RestRemote, RestRemoteConfig};
use tally_core::util::{http_base_url, non_blank, snippet};
use tally_core::{DeadLetter, Engine, EngineConfig, LocalStore, MutationId, Record};

use crate::error::CliError;

pub const DB_PATH_ENV: &str = "TALLY_DB_PATH";
pub const CONFIG_PATH_ENV: &str = "TALLY_CONFIG";
pub const REMOTE_URL_ENV: &str = "TALLY_REMOTE_URL";
pub const REMOTE_AUTH_ENV: &str = "TALLY_REMOTE_AUTH";

/// Everything a command needs to open the engine
#[derive(Debug, Clone)]
pub struct Context {
    pub db_path: PathBuf,
    pub config: EngineConfig,
    pub remote: Option<RestRemoteConfig>,
}

impl Context {
    /// Resolve flags against environment variables and defaults
    pub fn resolve(
        db: Option<PathBuf>,
        config: Option<PathBuf>,
        remote: Option<String>,
    ) -> Result<Self, CliError> {
        let db_path = resolve_db_path(db);
        let config = load_config(resolve_config_path(config).as_deref())?;
        let remote = resolve_remote(
            remote,
            env::var(REMOTE_URL_ENV).ok(),
            env::var(REMOTE_AUTH_ENV).ok(),
        )?;

        Ok(Self {
            db_path,
            config,
            remote,
        })
    }
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os(DB_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tally")
        .join("tally.db")
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tally").join("config.json"))
}

/// Explicit path, then `TALLY_CONFIG`, then the default location if it exists
pub fn resolve_config_path(cli_config_path: Option<PathBuf>) -> Option<PathBuf> {
    cli_config_path
        .or_else(|| env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
        .or_else(|| default_config_path().filter(|path| path.is_file()))
}

pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, CliError> {
    match path {
        Some(path) => Ok(EngineConfig::load_from_path(path)?),
        None => Ok(EngineConfig::default()),
    }
}

/// `--remote` wins over `TALLY_REMOTE_URL`; the token only comes from env.
pub fn resolve_remote(
    cli_url: Option<String>,
    env_url: Option<String>,
    env_auth: Option<String>,
) -> Result<Option<RestRemoteConfig>, CliError> {
    let Some(url) = non_blank(cli_url).or_else(|| non_blank(env_url))
    else {
        return Ok(None);
    };

    let Some(base_url) = http_base_url(&url) else {
        return Err(CliError::Config(format!(
            "Remote URL must start with http:// or https:// (got {url})"
        )));
    };

    Ok(Some(RestRemoteConfig::new(base_url).with_auth(env_auth)))
}

pub async fn open_engine(context: &Context) -> Result<Engine, CliError> {
    let store = LocalStore::open_path(&context.db_path, &context.config.collections)?;
    let mut builder = Engine::builder(context.config.clone()).store(store);
    if let Some(remote) = &context.remote {
        builder = builder.remote(Arc::new(RestRemote::new(remote.clone())?));
    }
    Ok(builder.build().await?)
}

pub fn parse_record(raw: &str) -> Result<Record, CliError> {
    Ok(Record::from_json_str(raw.trim())?)
}

pub fn parse_patch(raw: &str) -> Result<Map<String, Value>, CliError> {
    match serde_json::from_str::<Value>(raw.trim())? {
        Value::Object(fields) => Ok(fields),
        other => Err(CliError::InvalidPatch(snippet(&other.to_string()))),
    }
}

pub fn parse_mutation_id(raw: &str) -> Result<MutationId, CliError> {
    raw.trim()
        .parse::<MutationId>()
        .map_err(|_| CliError::InvalidMutationId(raw.trim().to_string()))
}

pub fn format_timestamp(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis).map_or_else(
        || millis.to_string(),
        |timestamp| timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

/// `{id}  {other fields as compact JSON}`
pub fn format_record_line(record: &Record) -> String {
    let fields = record
        .as_map()
        .iter()
        .filter(|(key, _)| key.as_str() != "id")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect::<Map<_, _>>();
    format!(
        "{}  {}",
        record.id(),
        snippet(&Value::Object(fields).to_string())
    )
}

#[derive(Debug, Serialize)]
pub struct DeadLetterItem {
    pub id: String,
    pub collection: String,
    pub action: String,
    pub record_id: Option<String>,
    pub attempts: u32,
    pub reason: String,
    pub quarantined_at: i64,
    pub quarantined_at_iso: String,
}

pub fn dead_letter_to_item(dead: &DeadLetter) -> DeadLetterItem {
    DeadLetterItem {
        id: dead.mutation.id.to_string(),
        collection: dead.mutation.collection.clone(),
        action: dead.mutation.action.to_string(),
        record_id: dead.mutation.record_id().ok().map(ToString::to_string),
        attempts: dead.mutation.attempts,
        reason: dead.reason.clone(),
        quarantined_at: dead.quarantined_at,
        quarantined_at_iso: format_timestamp(dead.quarantined_at),
    }
}

pub fn format_dead_letter_lines(dead_letters: &[DeadLetter]) -> Vec<String> {
    dead_letters
        .iter()
        .map(|dead| {
            let item = dead_letter_to_item(dead);
            format!(
                "{}  {} {}/{}  attempts={}  {}  {}",
                item.id,
                item.action,
                item.collection,
                item.record_id.as_deref().unwrap_or("?"),
                item.attempts,
                item.quarantined_at_iso,
                item.reason
            )
        })
        .collect()
}
