//! Test utilities for Forkchat
//!
//! Builders for chat-completion stream frames, temporary directories and
//! assertion helpers shared by unit tests.

use serde_json::json;
use tempfile::TempDir;

/// Create a temporary directory for testing
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

/// Frame carrying an answer text delta
pub fn text_frame(delta: &str) -> String {
    json!({"choices": [{"delta": {"content": delta}}]}).to_string()
}

/// Frame carrying a reasoning delta
pub fn thinking_frame(delta: &str) -> String {
    json!({"choices": [{"delta": {"reasoning": delta}}]}).to_string()
}

/// Frame carrying one complete tool-call delta at index 0
pub fn tool_call_frame(id: &str, name: &str, arguments: &str) -> String {
    json!({"choices": [{"delta": {"tool_calls": [
        {"index": 0, "id": id, "function": {"name": name, "arguments": arguments}}
    ]}}]})
    .to_string()
}

/// Frame carrying only token usage
pub fn usage_frame(input: u64, output: u64) -> String {
    json!({"choices": [], "usage": {"prompt_tokens": input, "completion_tokens": output}})
        .to_string()
}

/// Frame carrying an inline generated image
pub fn image_frame(data_uri: &str) -> String {
    json!({"choices": [{"delta": {"images": [
        {"type": "image_url", "image_url": {"url": data_uri}}
    ]}}]})
    .to_string()
}

/// Wraps payloads as SSE `data:` events
///
/// `[DONE]` is passed through like any other payload.
pub fn sse_body<S: AsRef<str>>(payloads: &[S]) -> String {
    payloads
        .iter()
        .map(|p| format!("data: {}\n\n", p.as_ref()))
        .collect()
}

/// Assert that an error's display contains the expected text
///
/// # Panics
///
/// Panics if the result is `Ok` or the message does not match
pub fn assert_error_contains<T: std::fmt::Debug>(result: crate::error::Result<T>, expected: &str) {
    match result {
        Ok(value) => panic!("Expected error containing '{}', got Ok({:?})", expected, value),
        Err(e) => {
            let message = format!("{:#}", e);
            assert!(
                message.contains(expected),
                "Expected error containing '{}', got '{}'",
                expected,
                message
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_body_frames_payloads() {
        let body = sse_body(&[text_frame("a"), "[DONE]".to_string()]);
        assert!(body.starts_with("data: {"));
        assert!(body.ends_with("data: [DONE]\n\n"));
        assert_eq!(body.matches("\n\n").count(), 2);
    }

    #[test]
    fn test_assert_error_contains() {
        let result: crate::error::Result<()> =
            Err(crate::error::ForkchatError::Storage("disk full".into()).into());
        assert_error_contains(result, "disk full");
    }

    #[test]
    #[should_panic]
    fn test_assert_error_contains_panics_on_ok() {
        assert_error_contains(Ok(1), "anything");
    }
}
