//! Layered configuration: CLI flags override environment variables (loaded
//! via `dotenvy` first), which override an optional `--config` TOML file's
//! defaults. Mirrors the teacher's clap-derive + dotenvy startup sequence.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::model::Provider;

#[derive(Debug, Clone, Copy, ValueEnum, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CliProvider {
    Claude,
    Cursor,
}

#[derive(Debug, Clone, Copy, ValueEnum, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "taskforge-core", version, about = "Webhook-driven task orchestrator")]
pub struct Config {
    /// Optional TOML file providing defaults below CLI/env overrides.
    #[arg(long, env = "TASKFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "LOG_ROOT", default_value = "/data/logs/tasks")]
    pub log_root: PathBuf,

    #[arg(long, env = "LEASE_SECONDS", default_value_t = 900)]
    pub lease_seconds: u64,

    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long, env = "TASK_DEADLINE_SECONDS", default_value_t = 1800)]
    pub task_deadline_seconds: u64,

    #[arg(long, env = "CLI_PROVIDER", value_enum, default_value_t = CliProvider::Claude)]
    pub cli_provider: CliProvider,

    #[arg(long, env = "MAX_CONCURRENT_PER_WORKER", default_value_t = 1)]
    pub max_concurrent_per_worker: u32,

    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "REDIS_URL")]
    pub redis_url: String,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: SocketAddr,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[arg(long, env = "WORKSPACE_ROOT", default_value = "/data/workspaces")]
    pub workspace_root: PathBuf,

    /// `service-kind=url` pairs, repeatable.
    #[arg(long = "service-base-url", env = "SERVICE_BASE_URLS", value_delimiter = ',')]
    pub service_base_urls_raw: Vec<String>,

    /// `provider=secret` pairs, repeatable.
    #[arg(long = "webhook-secret", env = "WEBHOOK_SECRETS", value_delimiter = ',')]
    pub webhook_secrets_raw: Vec<String>,
}

/// A subset of `Config` fields that may also be supplied via TOML file, read
/// before CLI/env parsing overwrites anything the user set explicitly.
#[derive(Debug, Deserialize, Default)]
struct FileDefaults {
    log_root: Option<PathBuf>,
    lease_seconds: Option<u64>,
    max_attempts: Option<u32>,
    task_deadline_seconds: Option<u64>,
    bind_addr: Option<String>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let mut cfg = Config::parse();
        if let Some(path) = cfg.config.clone() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
            let defaults: FileDefaults = toml::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?;
            if let Some(v) = defaults.log_root {
                cfg.log_root = v;
            }
            if let Some(v) = defaults.lease_seconds {
                cfg.lease_seconds = v;
            }
            if let Some(v) = defaults.max_attempts {
                cfg.max_attempts = v;
            }
            if let Some(v) = defaults.task_deadline_seconds {
                cfg.task_deadline_seconds = v;
            }
            if let Some(v) = defaults.bind_addr {
                cfg.bind_addr = v.parse()?;
            }
        }
        Ok(cfg)
    }

    pub fn service_base_urls(&self) -> anyhow::Result<HashMap<Provider, String>> {
        parse_pairs(&self.service_base_urls_raw, Provider::from_path_segment)
    }

    pub fn webhook_secrets(&self) -> anyhow::Result<HashMap<Provider, String>> {
        parse_pairs(&self.webhook_secrets_raw, Provider::from_path_segment)
    }
}

fn parse_pairs<T>(
    raw: &[String],
    key_parse: impl Fn(&str) -> Option<T>,
) -> anyhow::Result<HashMap<T, String>>
where
    T: std::hash::Hash + Eq,
{
    let mut out = HashMap::new();
    for entry in raw {
        let (k, v) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected key=value, got {entry:?}"))?;
        let key = key_parse(k).ok_or_else(|| anyhow::anyhow!("unrecognized key {k:?}"))?;
        out.insert(key, v.to_string());
    }
    Ok(out)
}
