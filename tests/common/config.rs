//! Test configuration helpers: write a config file pointing at a mock server

use std::path::{Path, PathBuf};
use wiremock::MockServer;

/// Write a JSON config for `server` into `dir` and return its path
///
/// Durations are milliseconds. Retries are kept fast (1ms backoff, no jitter) and payloads land in
/// `dir/out`, metrics in `dir/metrics.json`.
pub fn write_config(dir: &Path, server: &MockServer, max_iterations: u32) -> PathBuf {
    let config = serde_json::json!({
        "fetch": {
            "max_concurrent_requests": 4,
            "user_agent": "fanout-fetch-tests"
        },
        "retry": {
            "max_attempts": 2,
            "per_attempt_timeout": 5000,
            "backoff_base": 1,
            "jitter": false
        },
        "leaf_retry": {
            "max_attempts": 2
        },
        "run": {
            "manifest_url": format!("{}/batch.json", server.uri()),
            "group_manifest_base": format!("{}/groups/", server.uri()),
            "max_iterations": max_iterations,
            "iteration_delay": 10,
            "output_dir": dir.join("out"),
            "metrics_path": dir.join("metrics.json")
        }
    });

    let path = dir.join("config.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    path
}
