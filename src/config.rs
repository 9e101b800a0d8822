// =============================================================================
// Runtime Configuration — environment-driven, immutable after startup
// =============================================================================
//
// Every tunable of the coordinator collapses into one `Config` value built
// once in `main` and passed by reference (inside `Arc<AppState>`). Workers
// never re-read the environment.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{FeedKind, ScheduledPredictionConfig};

// =============================================================================
// Config
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // ── Cycle cadence ───────────────────────────────────────────────────
    /// Score-cycle and dispatcher fallback-poll interval (seconds).
    pub checkpoint_interval_seconds: u64,
    /// Checkpoint roll-up period (seconds). Weekly by default.
    pub checkpoint_period_seconds: u64,

    // ── Model runner ────────────────────────────────────────────────────
    pub model_runner_host: String,
    pub model_runner_port: u16,
    pub model_runner_timeout_seconds: f64,
    pub gateway_cert_dir: Option<String>,
    pub secure_cert_dir: Option<String>,
    pub crunch_id: String,

    // ── Feed ingestion & input assembly ─────────────────────────────────
    pub feed_provider: String,
    pub feed_subjects: Vec<String>,
    pub feed_kind: FeedKind,
    pub feed_granularity: String,
    pub feed_poll_seconds: u64,
    pub feed_backfill_minutes: i64,
    pub feed_candles_window: usize,

    // ── Retention ───────────────────────────────────────────────────────
    pub feed_record_ttl_days: i64,
    pub feed_retention_check_seconds: u64,

    // ── Read API ────────────────────────────────────────────────────────
    pub api_key: Option<String>,
    pub api_read_auth: bool,
    pub api_public_prefixes: Vec<String>,
    pub api_admin_prefixes: Vec<String>,
    pub bind_addr: String,

    // ── On-chain identifiers ────────────────────────────────────────────
    pub crunch_pubkey: String,
    pub compute_provider: Option<String>,
    pub data_provider: Option<String>,

    // ── Seeds & data files ──────────────────────────────────────────────
    pub scheduled_configs_path: Option<String>,
    pub backfill_data_dir: String,
}

const DEFAULT_PUBLIC_PREFIXES: &[&str] = &[
    "/healthz",
    "/reports/schema",
    "/reports/leaderboard",
    "/reports/models",
    "/reports/feeds",
];

const DEFAULT_ADMIN_PREFIXES: &[&str] = &["/reports/backfill", "/reports/checkpoints/"];

impl Config {
    /// Build from the process environment. Missing variables fall back to
    /// development defaults; nothing here can fail.
    pub fn from_env() -> Self {
        Self {
            checkpoint_interval_seconds: env_parse("CHECKPOINT_INTERVAL_SECONDS", 60),
            checkpoint_period_seconds: env_parse("CHECKPOINT_PERIOD_SECONDS", 7 * 24 * 3600),

            model_runner_host: env_str("MODEL_RUNNER_NODE_HOST", "model-orchestrator"),
            model_runner_port: env_parse("MODEL_RUNNER_NODE_PORT", 9091),
            model_runner_timeout_seconds: env_parse("MODEL_RUNNER_TIMEOUT_SECONDS", 60.0),
            gateway_cert_dir: env_opt("GATEWAY_CERT_DIR"),
            secure_cert_dir: env_opt("SECURE_CERT_DIR"),
            crunch_id: env_str("CRUNCH_ID", "starter-challenge"),

            feed_provider: env_str("FEED_PROVIDER", "binance").to_lowercase(),
            feed_subjects: parse_subjects(env_opt("FEED_SUBJECTS")),
            feed_kind: env_opt("FEED_KIND")
                .as_deref()
                .and_then(FeedKind::parse)
                .unwrap_or(FeedKind::Candle),
            feed_granularity: env_str("FEED_GRANULARITY", "1m"),
            feed_poll_seconds: env_parse("FEED_POLL_SECONDS", 5),
            feed_backfill_minutes: env_parse("FEED_BACKFILL_MINUTES", 180),
            feed_candles_window: env_parse("FEED_CANDLES_WINDOW", 120),

            feed_record_ttl_days: env_parse("FEED_RECORD_TTL_DAYS", 14),
            feed_retention_check_seconds: env_parse("FEED_RETENTION_CHECK_SECONDS", 3600),

            api_key: env_opt("API_KEY"),
            api_read_auth: parse_flag(env_opt("API_READ_AUTH")),
            api_public_prefixes: parse_prefixes(
                env_opt("API_PUBLIC_PREFIXES"),
                DEFAULT_PUBLIC_PREFIXES,
            ),
            api_admin_prefixes: parse_prefixes(
                env_opt("API_ADMIN_PREFIXES"),
                DEFAULT_ADMIN_PREFIXES,
            ),
            bind_addr: env_str("MERIDIAN_BIND_ADDR", "0.0.0.0:8000"),

            crunch_pubkey: env_str("CRUNCH_PUBKEY", ""),
            compute_provider: env_opt("COMPUTE_PROVIDER_PUBKEY"),
            data_provider: env_opt("DATA_PROVIDER_PUBKEY"),

            scheduled_configs_path: env_opt("SCHEDULED_PREDICTION_CONFIGS_PATH"),
            backfill_data_dir: env_str("BACKFILL_DATA_DIR", "data/backfill"),
        }
    }

    /// The primary feed subject used for input assembly and truth windows.
    pub fn primary_subject(&self) -> &str {
        self.feed_subjects
            .first()
            .map(String::as_str)
            .unwrap_or("BTCUSDT")
    }

    /// Load the scheduled-prediction config seed. An unreadable or
    /// unparseable file aborts startup — a node silently running without its
    /// configured schedules is worse than one that refuses to boot.
    pub fn load_scheduled_configs(&self) -> Result<Vec<ScheduledPredictionConfig>> {
        let Some(path) = &self.scheduled_configs_path else {
            return Ok(Vec::new());
        };
        let raw = std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("reading scheduled prediction configs from {path}"))?;
        let configs: Vec<ScheduledPredictionConfig> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing scheduled prediction configs from {path}"))?;
        for cfg in &configs {
            if cfg.schedule.prediction_interval_seconds < 1 {
                anyhow::bail!(
                    "config {}: prediction_interval_seconds must be >= 1",
                    cfg.id
                );
            }
        }
        info!(count = configs.len(), path = %path, "loaded scheduled prediction configs");
        Ok(configs)
    }
}

// =============================================================================
// Env helpers
// =============================================================================

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_str(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_flag(raw: Option<String>) -> bool {
    matches!(
        raw.as_deref().map(str::to_lowercase).as_deref(),
        Some("true") | Some("1") | Some("yes")
    )
}

fn parse_subjects(raw: Option<String>) -> Vec<String> {
    let subjects: Vec<String> = raw
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if subjects.is_empty() {
        vec!["BTCUSDT".to_string()]
    } else {
        subjects
    }
}

fn parse_prefixes(raw: Option<String>, defaults: &[&str]) -> Vec<String> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        _ => defaults.iter().map(|p| p.to_string()).collect(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_default_and_normalize() {
        assert_eq!(parse_subjects(None), vec!["BTCUSDT".to_string()]);
        assert_eq!(
            parse_subjects(Some("btcusdt, ethusdt,,".into())),
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
        );
    }

    #[test]
    fn flag_parsing() {
        assert!(parse_flag(Some("true".into())));
        assert!(parse_flag(Some("1".into())));
        assert!(parse_flag(Some("YES".into())));
        assert!(!parse_flag(Some("false".into())));
        assert!(!parse_flag(None));
    }

    #[test]
    fn prefixes_fall_back_to_defaults() {
        let prefixes = parse_prefixes(None, DEFAULT_ADMIN_PREFIXES);
        assert!(prefixes.contains(&"/reports/backfill".to_string()));
        let custom = parse_prefixes(Some("/a, /b".into()), DEFAULT_ADMIN_PREFIXES);
        assert_eq!(custom, vec!["/a".to_string(), "/b".to_string()]);
    }

    #[test]
    fn schedule_seed_parses() {
        let raw = r#"[
            {"id": "c1", "scope_key": "btc-1m",
             "schedule": {"prediction_interval_seconds": 60, "resolve_after_seconds": 120},
             "order": 0},
            {"id": "c2", "scope_key": "btc-5m"}
        ]"#;
        let configs: Vec<ScheduledPredictionConfig> = serde_json::from_str(raw).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].schedule.resolve_after_seconds, Some(120));
        assert!(configs[1].active);
        assert_eq!(configs[1].schedule.prediction_interval_seconds, 60);
    }
}
