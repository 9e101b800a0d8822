// =============================================================================
// Model Runner — remote fan-out RPC client
// =============================================================================
//
// The dispatcher talks to the competitor fleet through this trait: `tick`
// pushes the latest input to every connected model, `call` fans a method out
// and collects per-model results. The HTTP implementation posts JSON to the
// orchestrator; connection security is picked from the certificate
// directories (gateway TLS → mTLS → insecure, first match wins).
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::config::Config;
use crate::types::{JsonMap, Model};

/// A connected model run as reported by the orchestrator.
#[derive(Debug, Clone)]
pub struct ModelRun {
    pub model_id: String,
    pub model_name: String,
    pub deployment_id: String,
    pub cruncher_id: String,
    pub cruncher_name: String,
}

impl ModelRun {
    /// Materialize the registry row for this run.
    pub fn to_model(&self) -> Model {
        let now = chrono::Utc::now();
        Model {
            id: self.model_id.clone(),
            name: self.model_name.clone(),
            player_id: self.cruncher_id.clone(),
            player_name: self.cruncher_name.clone(),
            deployment_identifier: self.deployment_id.clone(),
            overall_score: JsonMap::new(),
            scores_by_scope: Vec::new(),
            meta: JsonMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-model outcome of one fan-out call.
#[derive(Debug, Clone)]
pub struct RunnerResult {
    /// "SUCCESS", "TIMEOUT", "FAILED", …
    pub status: String,
    pub result: Value,
    pub exec_time_us: f64,
}

#[async_trait]
pub trait ModelRunner: Send + Sync {
    /// One-time connection setup; idempotent.
    async fn init(&self) -> Result<()>;

    /// Fan `method(payload)` out to all connected models and collect their
    /// responses. Models that do not appear in the result did not respond.
    async fn call(&self, method: &str, payload: &JsonMap)
        -> Result<Vec<(ModelRun, RunnerResult)>>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

pub struct HttpModelRunner {
    base_url: String,
    crunch_id: String,
    client: reqwest::Client,
}

impl HttpModelRunner {
    pub fn from_config(config: &Config) -> Result<Self> {
        let (client, scheme) = build_client(config)?;
        let base_url = format!(
            "{}://{}:{}",
            scheme, config.model_runner_host, config.model_runner_port
        );
        Ok(Self {
            base_url,
            crunch_id: config.crunch_id.clone(),
            client,
        })
    }

    fn decode_responses(payload: &Value) -> Vec<(ModelRun, RunnerResult)> {
        let rows = payload
            .get("responses")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(model) = row.get("model") else { continue };
            let get = |obj: &Value, key: &str, fallback: &str| {
                obj.get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or(fallback)
                    .to_string()
            };
            let infos = model.get("infos").cloned().unwrap_or(Value::Null);
            let run = ModelRun {
                model_id: get(model, "model_id", ""),
                model_name: get(model, "model_name", "unknown-model"),
                deployment_id: get(model, "deployment_id", "unknown-deployment"),
                cruncher_id: get(&infos, "cruncher_id", "unknown-player"),
                cruncher_name: get(&infos, "cruncher_name", "Unknown"),
            };
            if run.model_id.is_empty() {
                continue;
            }
            let result = RunnerResult {
                status: get(&row, "status", "UNKNOWN"),
                result: row.get("result").cloned().unwrap_or(Value::Null),
                exec_time_us: row
                    .get("exec_time_us")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0),
            };
            out.push((run, result));
        }
        out
    }
}

#[async_trait]
impl ModelRunner for HttpModelRunner {
    async fn init(&self) -> Result<()> {
        let url = format!("{}/v1/runners/init", self.base_url);
        let body = serde_json::json!({ "crunch_id": self.crunch_id });
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("runner init request failed")?
            .error_for_status()
            .context("runner init returned an error status")?;
        info!(base_url = %self.base_url, "model runner initialised");
        Ok(())
    }

    async fn call(
        &self,
        method: &str,
        payload: &JsonMap,
    ) -> Result<Vec<(ModelRun, RunnerResult)>> {
        let url = format!("{}/v1/runners/call", self.base_url);
        let body = serde_json::json!({
            "crunch_id": self.crunch_id,
            "method": method,
            "payload": payload,
        });
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("runner call {method} failed"))?
            .error_for_status()
            .with_context(|| format!("runner call {method} returned an error status"))?;
        let payload: Value = resp
            .json()
            .await
            .context("failed to decode runner response")?;
        Ok(Self::decode_responses(&payload))
    }
}

/// Build the HTTP client for the configured connection mode.
///
/// Modes (mutually exclusive, first match wins):
///   1. `GATEWAY_CERT_DIR` → TLS to a terminating gateway; the gateway's CA
///      certificate (`ca.pem`) is trusted explicitly.
///   2. `SECURE_CERT_DIR`  → direct mTLS; client identity from
///      `cert.pem` + `key.pem`, peer CA from `ca.pem`.
///   3. Neither            → insecure plain HTTP (local development).
fn build_client(config: &Config) -> Result<(reqwest::Client, &'static str)> {
    let timeout = Duration::from_secs_f64(config.model_runner_timeout_seconds.max(1.0));
    let mut builder = reqwest::Client::builder().timeout(timeout);

    if let Some(dir) = &config.gateway_cert_dir {
        let ca = read_pem(dir, "ca.pem")?;
        builder = builder.add_root_certificate(
            reqwest::Certificate::from_pem(&ca).context("parsing gateway ca.pem")?,
        );
        info!(dir = %dir, "using gateway TLS credentials");
        let client = builder.build().context("building gateway TLS client")?;
        return Ok((client, "https"));
    }

    if let Some(dir) = &config.secure_cert_dir {
        let cert = read_pem(dir, "cert.pem")?;
        let key = read_pem(dir, "key.pem")?;
        let identity = reqwest::Identity::from_pkcs8_pem(&cert, &key)
            .context("parsing client identity from cert.pem/key.pem")?;
        builder = builder.identity(identity);
        let ca = read_pem(dir, "ca.pem")?;
        builder = builder.add_root_certificate(
            reqwest::Certificate::from_pem(&ca).context("parsing secure ca.pem")?,
        );
        info!(dir = %dir, "using mTLS secure credentials");
        let client = builder.build().context("building mTLS client")?;
        return Ok((client, "https"));
    }

    info!("using insecure runner connection (no credentials configured)");
    let client = builder.build().context("building insecure client")?;
    Ok((client, "http"))
}

fn read_pem(dir: &str, name: &str) -> Result<Vec<u8>> {
    let path = Path::new(dir).join(name);
    std::fs::read(&path).with_context(|| format!("reading {}", path.display()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_responses_maps_models_and_results() {
        let payload = serde_json::json!({
            "responses": [
                {
                    "model": {
                        "model_id": "m1",
                        "model_name": "alpha",
                        "deployment_id": "dep-1",
                        "infos": {"cruncher_id": "p1", "cruncher_name": "Player One"}
                    },
                    "status": "SUCCESS",
                    "result": {"value": 0.12},
                    "exec_time_us": 4200.0
                },
                {
                    "model": {"model_id": "m2", "model_name": "beta"},
                    "status": "TIMEOUT",
                    "result": null
                }
            ]
        });
        let decoded = HttpModelRunner::decode_responses(&payload);
        assert_eq!(decoded.len(), 2);

        let (run, result) = &decoded[0];
        assert_eq!(run.model_id, "m1");
        assert_eq!(run.cruncher_name, "Player One");
        assert_eq!(result.status, "SUCCESS");
        assert_eq!(result.result.get("value").unwrap().as_f64().unwrap(), 0.12);
        assert_eq!(result.exec_time_us, 4200.0);

        let (run2, result2) = &decoded[1];
        assert_eq!(run2.cruncher_id, "unknown-player");
        assert_eq!(result2.status, "TIMEOUT");
    }

    #[test]
    fn decode_skips_rows_without_model_id() {
        let payload = serde_json::json!({
            "responses": [{"model": {}, "status": "SUCCESS"}]
        });
        assert!(HttpModelRunner::decode_responses(&payload).is_empty());
    }

    #[test]
    fn model_run_materializes_registry_row() {
        let run = ModelRun {
            model_id: "m1".into(),
            model_name: "alpha".into(),
            deployment_id: "dep-1".into(),
            cruncher_id: "p1".into(),
            cruncher_name: "Player One".into(),
        };
        let model = run.to_model();
        assert_eq!(model.id, "m1");
        assert_eq!(model.player_name, "Player One");
        assert_eq!(model.deployment_identifier, "dep-1");
    }
}
