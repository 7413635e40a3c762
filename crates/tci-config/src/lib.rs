//! Layered YAML configuration loading + canonical hashing, and env-based
//! secret resolution.
//!
//! Config YAML carries the ingress pipeline's tuning knobs
//! (`bufferCapacity`, `flushIntervalMs`, ...). Secrets (DB URL, Kafka
//! bootstrap servers, schema registry URL) are resolved once at startup from
//! the environment into [`ResolvedEnv`] — callers should not scatter
//! `std::env::var` calls elsewhere.

pub mod secrets;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

pub use secrets::ResolvedEnv;

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        merge_yaml_str(&mut merged, &s, p)?;
    }

    finish_load(merged)
}

/// Same as [`load_layered_yaml`] but from in-memory strings (used by tests).
pub fn load_layered_yaml_from_strings(docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());
    for (i, s) in docs.iter().enumerate() {
        merge_yaml_str(&mut merged, s, &format!("<inline:{i}>"))?;
    }
    finish_load(merged)
}

fn merge_yaml_str(merged: &mut Value, s: &str, label: &str) -> Result<()> {
    let yaml_val: serde_yaml::Value =
        serde_yaml::from_str(s).with_context(|| format!("parse yaml: {label}"))?;
    let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
    deep_merge(merged, json_val);
    Ok(())
}

fn finish_load(merged: Value) -> Result<LoadedConfig> {
    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    let config_json: Value =
        serde_json::from_str(&canonical).context("canonical json parse failed")?;
    let ingress = IngressConfig::from_json(&config_json)?;

    Ok(LoadedConfig {
        config_json,
        canonical_json: canonical,
        config_hash: hash,
        ingress,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
    pub ingress: IngressConfig,
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON, so the hash is stable regardless of source key order.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

fn cfg_i64(v: &Value, ptr: &str, default: i64) -> i64 {
    v.pointer(ptr).and_then(Value::as_i64).unwrap_or(default)
}

fn cfg_f64(v: &Value, ptr: &str, default: f64) -> f64 {
    v.pointer(ptr).and_then(Value::as_f64).unwrap_or(default)
}

fn cfg_str(v: &Value, ptr: &str, default: &str) -> String {
    v.pointer(ptr)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

/// The full configuration surface the ingress pipeline is tuned by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    pub buffer_capacity: usize,
    pub flush_interval_ms: u64,
    pub batch_min: usize,
    pub batch_max: usize,
    pub target_latency_ms: u64,
    pub pub_timeout_ms: u64,
    pub system_failure_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub breaker_failure_rate: f64,
    pub breaker_open_duration_ms: u64,
    pub stream_name: String,
    pub consumer_name: String,
    pub dest_topic: String,
    /// Bounded wait for a blocked buffer enqueue, in ms.
    pub enqueue_wait_ms: u64,
    /// Idle-interval sleep when a dispatch fetch returns no pending rows.
    pub dispatch_idle_interval_ms: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            flush_interval_ms: 500,
            batch_min: 16,
            batch_max: 2_048,
            target_latency_ms: 200,
            pub_timeout_ms: 5_000,
            system_failure_backoff_ms: 250,
            max_backoff_ms: 30_000,
            breaker_failure_rate: 0.5,
            breaker_open_duration_ms: 10_000,
            stream_name: "trade-events".to_string(),
            consumer_name: "trade-ingress".to_string(),
            dest_topic: "trade-events.committed".to_string(),
            enqueue_wait_ms: 50,
            dispatch_idle_interval_ms: 200,
        }
    }
}

impl IngressConfig {
    pub fn from_json(v: &Value) -> Result<Self> {
        let d = IngressConfig::default();
        Ok(Self {
            buffer_capacity: cfg_i64(v, "/bufferCapacity", d.buffer_capacity as i64) as usize,
            flush_interval_ms: cfg_i64(v, "/flushIntervalMs", d.flush_interval_ms as i64) as u64,
            batch_min: cfg_i64(v, "/batchMin", d.batch_min as i64) as usize,
            batch_max: cfg_i64(v, "/batchMax", d.batch_max as i64) as usize,
            target_latency_ms: cfg_i64(v, "/targetLatencyMs", d.target_latency_ms as i64) as u64,
            pub_timeout_ms: cfg_i64(v, "/pubTimeoutMs", d.pub_timeout_ms as i64) as u64,
            system_failure_backoff_ms: cfg_i64(
                v,
                "/systemFailureBackoffMs",
                d.system_failure_backoff_ms as i64,
            ) as u64,
            max_backoff_ms: cfg_i64(v, "/maxBackoffMs", d.max_backoff_ms as i64) as u64,
            breaker_failure_rate: cfg_f64(
                v,
                "/breaker/failureRate",
                d.breaker_failure_rate,
            ),
            breaker_open_duration_ms: cfg_i64(
                v,
                "/breaker/openDurationMs",
                d.breaker_open_duration_ms as i64,
            ) as u64,
            stream_name: cfg_str(v, "/streamName", &d.stream_name),
            consumer_name: cfg_str(v, "/consumerName", &d.consumer_name),
            dest_topic: cfg_str(v, "/destTopic", &d.dest_topic),
            enqueue_wait_ms: cfg_i64(v, "/enqueueWaitMs", d.enqueue_wait_ms as i64) as u64,
            dispatch_idle_interval_ms: cfg_i64(
                v,
                "/dispatchIdleIntervalMs",
                d.dispatch_idle_interval_ms as i64,
            ) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_YAML: &str = r#"
bufferCapacity: 500
flushIntervalMs: 250
batchMin: 8
batchMax: 256
targetLatencyMs: 100
pubTimeoutMs: 3000
systemFailureBackoffMs: 100
maxBackoffMs: 5000
breaker:
  failureRate: 0.4
  openDurationMs: 8000
streamName: "trades-raw"
consumerName: "ingress-dev"
destTopic: "trades-committed"
"#;

    #[test]
    fn layered_config_overrides_in_order() {
        let override_yaml = "batchMax: 1024\n";
        let loaded =
            load_layered_yaml_from_strings(&[BASE_YAML, override_yaml]).expect("load config");
        assert_eq!(loaded.ingress.batch_max, 1024);
        assert_eq!(loaded.ingress.batch_min, 8, "unrelated keys unaffected");
    }

    #[test]
    fn config_hash_is_deterministic() {
        let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
        let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
        assert_eq!(a.config_hash, b.config_hash);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let loaded = load_layered_yaml_from_strings(&["streamName: only-this\n"]).unwrap();
        assert_eq!(loaded.ingress.stream_name, "only-this");
        assert_eq!(
            loaded.ingress.buffer_capacity,
            IngressConfig::default().buffer_capacity
        );
    }
}
