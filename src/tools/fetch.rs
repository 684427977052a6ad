//! `fetch_url` tool: retrieves a web page for the model
//!
//! Only advertised when the conversation enables URL context. Requests to
//! private, loopback and link-local addresses are refused, HTML is reduced
//! to Markdown-ish text and the output is truncated to the configured size.

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::conversation::Feature;
use crate::error::{ForkchatError, Result};
use crate::tools::{Tool, ToolExecutor, ToolResult};

/// Refuses URLs that point at the local network
#[derive(Debug, Clone, Default)]
pub struct SsrfValidator {
    allow_private_ips: bool,
}

impl SsrfValidator {
    /// Validator that blocks private address ranges
    pub fn new() -> Self {
        Self::default()
    }

    /// Validator that allows private IPs (for testing only)
    pub fn allow_private_ips() -> Self {
        Self {
            allow_private_ips: true,
        }
    }

    /// Checks scheme and host of `url`
    pub fn validate(&self, url: &str) -> Result<()> {
        let parsed = Url::parse(url).map_err(|e| ForkchatError::Tool(format!("Invalid URL: {}", e)))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ForkchatError::Tool(format!("Unsupported URL scheme: {}", other)).into())
            }
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ForkchatError::Tool("URL has no host".to_string()))?;
        if self.allow_private_ips {
            return Ok(());
        }
        if host.eq_ignore_ascii_case("localhost") {
            return Err(ForkchatError::Tool("Requests to localhost are not allowed".into()).into());
        }

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = IpAddr::from_str(host) {
            if is_private(ip) {
                return Err(ForkchatError::Tool(format!(
                    "Requests to private address {} are not allowed",
                    ip
                ))
                .into());
            }
        }
        Ok(())
    }
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.octets()[0] == 0
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// HTTP fetch tool
#[derive(Clone)]
pub struct FetchUrlTool {
    client: reqwest::Client,
    validator: SsrfValidator,
    max_size_bytes: usize,
}

impl FetchUrlTool {
    /// Creates a fetch tool
    pub fn new(timeout: Duration, max_size_bytes: usize) -> Self {
        Self::with_validator(timeout, max_size_bytes, SsrfValidator::new())
    }

    /// Creates a fetch tool that may reach private addresses (for testing only)
    pub fn new_for_testing(timeout: Duration, max_size_bytes: usize) -> Self {
        Self::with_validator(timeout, max_size_bytes, SsrfValidator::allow_private_ips())
    }

    fn with_validator(timeout: Duration, max_size_bytes: usize, validator: SsrfValidator) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            validator,
            max_size_bytes,
        }
    }

    async fn fetch(&self, url: &str) -> Result<ToolResult> {
        self.validator.validate(url)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ForkchatError::Tool(format!("Failed to fetch URL: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForkchatError::Tool(format!("HTTP {} for {}", status.as_u16(), url)).into());
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ForkchatError::Tool(format!("Failed to read response body: {}", e)))?;

        if bytes.contains(&0) {
            return Ok(ToolResult::success(format!(
                "{} returned binary content ({}), which cannot be displayed",
                url, content_type
            )));
        }

        let text = String::from_utf8_lossy(&bytes);
        let body = if content_type.contains("text/html") {
            html_to_text(&text)
        } else {
            text.into_owned()
        };

        Ok(ToolResult::success(format!(
            "Content from {} ({})\n\n{}",
            url, content_type, body
        ))
        .truncate_if_needed(self.max_size_bytes))
    }
}

impl std::fmt::Debug for FetchUrlTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchUrlTool")
            .field("max_size_bytes", &self.max_size_bytes)
            .finish()
    }
}

#[async_trait]
impl ToolExecutor for FetchUrlTool {
    fn tool_definition(&self) -> Tool {
        Tool::new(
            "fetch_url",
            "Fetch a public web page and return its text content",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "http(s) URL to fetch"}
                },
                "required": ["url"]
            }),
        )
    }

    fn feature(&self) -> Option<Feature> {
        Some(Feature::UrlContext)
    }

    async fn execute(&self, args: serde_json::Value) -> Result<ToolResult> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ForkchatError::Tool("missing required argument 'url'".into()))?;
        self.fetch(url).await
    }
}

/// Reduces HTML to readable text, keeping headings and links
pub fn html_to_text(html: &str) -> String {
    let rules: [(&str, &str); 8] = [
        (r"(?is)<script[^>]*>.*?</script>", ""),
        (r"(?is)<style[^>]*>.*?</style>", ""),
        (r"(?is)<h([1-6])[^>]*>(.*?)</h[1-6]>", "\n## $2\n"),
        (r#"(?is)<a[^>]*href\s*=\s*['"]([^'"]*)['"][^>]*>(.*?)</a>"#, "[$2]($1)"),
        (r"(?i)<br\s*/?>", "\n"),
        (r"(?i)</p>|</li>|</div>", "\n"),
        (r"<[^>]+>", ""),
        (r"\n\s*\n\s*\n+", "\n\n"),
    ];

    let mut result = html.to_string();
    for (pattern, replacement) in rules {
        if let Ok(re) = Regex::new(pattern) {
            result = re.replace_all(&result, replacement).into_owned();
        }
    }
    result
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&nbsp;", " ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_validator_blocks_private_targets() {
        let validator = SsrfValidator::new();
        assert!(validator.validate("https://example.com/page").is_ok());
        assert!(validator.validate("file:///etc/passwd").is_err());
        assert!(validator.validate("http://localhost:8080").is_err());
        assert!(validator.validate("http://127.0.0.1").is_err());
        assert!(validator.validate("http://10.1.2.3").is_err());
        assert!(validator.validate("http://172.20.0.1").is_err());
        assert!(validator.validate("http://192.168.0.10").is_err());
        assert!(validator.validate("http://169.254.169.254/latest").is_err());
        assert!(validator.validate("http://[::1]/").is_err());
        assert!(validator.validate("http://[fd00::1]/").is_err());
    }

    #[test]
    fn test_html_to_text() {
        let html = r#"<html><head><style>p{}</style><script>x()</script></head>
            <body><h1>Title</h1><p>Hello &amp; <b>welcome</b></p>
            <a href="https://example.com">link</a></body></html>"#;
        let text = html_to_text(html);
        assert!(text.contains("## Title"));
        assert!(text.contains("Hello & welcome"));
        assert!(text.contains("[link](https://example.com)"));
        assert!(!text.contains("x()"));
        assert!(!text.contains('<'));
    }

    #[tokio::test]
    async fn test_fetch_truncates_large_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/plain")
                    .set_body_string("a".repeat(5000)),
            )
            .mount(&server)
            .await;

        let tool = FetchUrlTool::new_for_testing(Duration::from_secs(5), 100);
        let result = tool
            .execute(json!({"url": format!("{}/big", server.uri())}))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.truncated);
        assert!(result.output.len() < 200);
    }

    #[tokio::test]
    async fn test_fetch_reports_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let tool = FetchUrlTool::new_for_testing(Duration::from_secs(5), 100);
        let err = tool
            .execute(json!({"url": server.uri()}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_missing_url_argument() {
        let tool = FetchUrlTool::new(Duration::from_secs(1), 100);
        assert!(tool.execute(json!({})).await.is_err());
    }
}
