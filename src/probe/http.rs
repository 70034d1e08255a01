//! HTTP probe implementation.

use super::{ProbeError, ProbeOutcome};

use regex::Regex;
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const MAX_HTTP_TIMEOUT_SECS: u64 = 32;
pub const DEFAULT_HTTP_STATUS_CODE: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Head,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProbeConfig {
    pub endpoint: String,
    pub method: HttpMethod,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Query parameters.
    pub params: BTreeMap<String, String>,
    pub body: Option<String>,
    pub allow_redirects: bool,
    pub verify_ssl: bool,
    pub timeout_secs: u64,
    pub status_code: u16,
    /// Regex searched for anywhere in the body.
    pub text_match: Option<String>,
    /// Header name to a regex its value must start with.
    pub header_match: BTreeMap<String, String>,
}

impl Default for HttpProbeConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            method: HttpMethod::Get,
            username: None,
            password: None,
            params: BTreeMap::new(),
            body: None,
            allow_redirects: true,
            verify_ssl: true,
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            status_code: DEFAULT_HTTP_STATUS_CODE,
            text_match: None,
            header_match: BTreeMap::new(),
        }
    }
}

impl HttpProbeConfig {
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.endpoint.trim().is_empty() {
            return Err(ProbeError::Config("HTTP endpoint must not be empty".to_string()));
        }
        if self.timeout_secs == 0 || self.timeout_secs > MAX_HTTP_TIMEOUT_SECS {
            return Err(ProbeError::Config(format!(
                "HTTP timeout must be between 1 and {} seconds",
                MAX_HTTP_TIMEOUT_SECS
            )));
        }
        if let Some(pattern) = &self.text_match {
            Regex::new(pattern).map_err(|e| ProbeError::Config(e.to_string()))?;
        }
        for pattern in self.header_match.values() {
            Regex::new(pattern).map_err(|e| ProbeError::Config(e.to_string()))?;
        }
        Ok(())
    }
}

/// Run an HTTP probe with the given configuration.
pub async fn run_http_probe(config: &HttpProbeConfig) -> Result<ProbeOutcome, ProbeError> {
    let redirects = if config.allow_redirects {
        Policy::limited(10)
    } else {
        Policy::none()
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .redirect(redirects)
        .danger_accept_invalid_certs(!config.verify_ssl)
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))?;

    let mut request = client
        .request(config.method.into(), &config.endpoint)
        .query(&config.params);
    if let Some(username) = &config.username {
        request = request.basic_auth(username, config.password.as_ref());
    }
    if let Some(body) = &config.body {
        request = request.body(body.clone());
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => return Ok(request_failure(&e)),
    };

    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => return Ok(request_failure(&e)),
    };

    Ok(evaluate_response(config, status, &headers, body))
}

fn request_failure(e: &reqwest::Error) -> ProbeOutcome {
    ProbeOutcome::failure(
        format!("Request error occurred: {}", e),
        vec![request_error_tag(e).to_string()],
    )
}

fn request_error_tag(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "Timeout"
    } else if e.is_connect() {
        "ConnectionError"
    } else if e.is_redirect() {
        "TooManyRedirects"
    } else {
        "RequestException"
    }
}

/// Judge a completed response against the configured expectations.
pub fn evaluate_response(
    config: &HttpProbeConfig,
    status: u16,
    headers: &HeaderMap,
    body: String,
) -> ProbeOutcome {
    let outcome = judge(config, status, headers, &body);
    outcome.with_raw_data(body)
}

fn judge(config: &HttpProbeConfig, status: u16, headers: &HeaderMap, body: &str) -> ProbeOutcome {
    if status != config.status_code {
        return ProbeOutcome::failure(
            format!("Wrong code: got {} (expected {})", status, config.status_code),
            vec![format!("status:{}", status)],
        );
    }

    if let Some(pattern) = &config.text_match {
        let matched = Regex::new(pattern).map(|re| re.is_match(body)).unwrap_or(false);
        if !matched {
            return ProbeOutcome::failure(
                format!("Failed to find match regex /{}/ in response body", pattern),
                vec!["text_match_failed".to_string()],
            );
        }
    }

    for (header, pattern) in &config.header_match {
        let Some(value) = headers.get(header.as_str()) else {
            return ProbeOutcome::failure(
                format!("Missing response header: {}", header),
                vec!["missing_header".to_string()],
            );
        };
        let value = value.to_str().unwrap_or_default();
        let matched = Regex::new(&format!("^(?:{})", pattern))
            .map(|re| re.is_match(value))
            .unwrap_or(false);
        if !matched {
            return ProbeOutcome::failure(
                format!("Mismatch in header: {} / {}", header, value),
                vec!["unexpected_header".to_string()],
            );
        }
    }

    ProbeOutcome::success()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn config() -> HttpProbeConfig {
        HttpProbeConfig {
            endpoint: "http://example.com".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let cfg = HttpProbeConfig {
            endpoint: "http://256.256.256.256".to_string(),
            timeout_secs: 1,
            ..Default::default()
        };
        let outcome = run_http_probe(&cfg).await.unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.tags.len(), 1);
    }

    #[test]
    fn test_wrong_status_code() {
        let outcome = evaluate_response(&config(), 503, &HeaderMap::new(), "down".to_string());
        assert!(!outcome.succeeded);
        assert_eq!(outcome.tags, vec!["status:503".to_string()]);
        assert_eq!(outcome.error.as_deref(), Some("Wrong code: got 503 (expected 200)"));
        assert_eq!(outcome.raw_data.as_deref(), Some("down"));
    }

    #[test]
    fn test_text_match() {
        let cfg = HttpProbeConfig {
            text_match: Some(r"[Vv]igil\s+ok".to_string()),
            ..config()
        };
        let ok = evaluate_response(&cfg, 200, &HeaderMap::new(), "status: vigil  ok".to_string());
        assert!(ok.succeeded);

        let bad = evaluate_response(&cfg, 200, &HeaderMap::new(), "nothing".to_string());
        assert_eq!(bad.tags, vec!["text_match_failed".to_string()]);
    }

    #[test]
    fn test_header_match() {
        let mut header_match = BTreeMap::new();
        header_match.insert("Content-Type".to_string(), "application/json".to_string());
        let cfg = HttpProbeConfig {
            header_match,
            ..config()
        };

        let missing = evaluate_response(&cfg, 200, &HeaderMap::new(), String::new());
        assert_eq!(missing.tags, vec!["missing_header".to_string()]);

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        let wrong = evaluate_response(&cfg, 200, &headers, String::new());
        assert_eq!(wrong.tags, vec!["unexpected_header".to_string()]);

        headers.insert("content-type", HeaderValue::from_static("application/json; charset=utf-8"));
        assert!(evaluate_response(&cfg, 200, &headers, String::new()).succeeded);
    }

    #[test]
    fn test_validate_limits() {
        assert!(config().validate().is_ok());
        assert!(HttpProbeConfig {
            timeout_secs: MAX_HTTP_TIMEOUT_SECS + 1,
            ..config()
        }
        .validate()
        .is_err());
        assert!(HttpProbeConfig {
            text_match: Some("(".to_string()),
            ..config()
        }
        .validate()
        .is_err());
        assert!(HttpProbeConfig::default().validate().is_err());
    }
}
