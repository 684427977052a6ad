use forkchat::auth::StaticTokenProvider;
use forkchat::config::ProviderConfig;
use forkchat::providers::OpenAiProvider;
use forkchat::storage::SqliteStorage;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::MockServer;

#[allow(dead_code)]
pub fn create_temp_storage() -> (SqliteStorage, TempDir) {
    let tmp = TempDir::new().expect("failed to create tempdir");
    let db_path = tmp.path().join("forkchat.db");
    let storage =
        SqliteStorage::new_with_path(db_path).expect("failed to create sqlite storage with path");
    (storage, tmp)
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// Streaming client pointed at a mock server
#[allow(dead_code)]
pub fn provider_for(server: &MockServer) -> OpenAiProvider {
    let config = ProviderConfig {
        api_base: format!("{}/v1", server.uri()),
        ..Default::default()
    };
    OpenAiProvider::new(&config, Arc::new(StaticTokenProvider::new("sk-test")))
        .expect("failed to build provider")
}

/// Wraps payloads as SSE `data:` events
#[allow(dead_code)]
pub fn sse_body(payloads: &[&str]) -> String {
    payloads
        .iter()
        .map(|p| format!("data: {}\n\n", p))
        .collect()
}

#[allow(dead_code)]
pub fn text_frame(delta: &str) -> String {
    serde_json::json!({"choices": [{"delta": {"content": delta}}]}).to_string()
}
