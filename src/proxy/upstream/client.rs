use std::time::Duration;

use reqwest::header;
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::debug;

use crate::constants;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::config::ProxyConfig;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

// One shared HTTP client per process; reqwest pools connections internally.
pub struct UpstreamClient {
    client: Client,
    chat_url: String,
    login_url: String,
    request_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig) -> ProxyResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(constants::USER_AGENT)
            .build()
            .map_err(|e| ProxyError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            chat_url: config.upstream_chat_url.clone(),
            login_url: config.upstream_login_url.clone(),
            request_timeout: config.request_timeout,
        })
    }

    // Issue one chat call with the given bearer token. Transport errors map
    // to `TokenAuthFailed` so the dispatch loop rotates to the next token;
    // timeouts surface as their own kind and fail the request.
    pub async fn chat(&self, token: &str, payload: &Value, stream: bool) -> ProxyResult<Response> {
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let chat_id = payload
            .get("chat_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        debug!("Upstream chat call (stream: {})", stream);
        self.client
            .post(&self.chat_url)
            .header(header::ACCEPT, accept)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::ORIGIN, constants::UPSTREAM_BASE_URL)
            .header(
                header::REFERER,
                format!("{}/c/{}", constants::UPSTREAM_BASE_URL, chat_id),
            )
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProxyError::UpstreamTimeout(self.request_timeout.as_secs())
                } else {
                    ProxyError::TokenAuthFailed(format!("transport error: {}", e))
                }
            })
    }

    // Exchange account credentials for a bearer token. The upstream returns
    // the token in the `Set-Cookie: token=<value>` header; the JSON body
    // `token` field is read as a fallback.
    pub async fn login(&self, email: &str, password: &str) -> ProxyResult<String> {
        let response = self
            .client
            .post(&self.login_url)
            .timeout(LOGIN_TIMEOUT)
            .header(header::ORIGIN, constants::UPSTREAM_BASE_URL)
            .header(
                header::REFERER,
                format!("{}/auth?mode=signin", constants::UPSTREAM_BASE_URL),
            )
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(|e| ProxyError::Refresher(format!("login request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::Refresher(format!(
                "login returned HTTP {}",
                status
            )));
        }

        if let Some(token) = extract_token_from_cookies(&response) {
            return Ok(token);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProxyError::Refresher(format!("login response unreadable: {}", e)))?;
        body.get("token")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ProxyError::Refresher("login response carried no token".to_string()))
    }
}

fn extract_token_from_cookies(response: &Response) -> Option<String> {
    for cookie_header in response.headers().get_all(header::SET_COOKIE) {
        let Ok(raw) = cookie_header.to_str() else {
            continue;
        };
        if let Some(token) = parse_token_cookie(raw) {
            return Some(token);
        }
    }
    None
}

fn parse_token_cookie(raw: &str) -> Option<String> {
    raw.split(';')
        .map(str::trim)
        .find_map(|segment| segment.strip_prefix("token="))
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_cookie_is_extracted_from_attributes() {
        let raw = "token=abc.def.ghi; Path=/; HttpOnly; Secure; SameSite=Lax";
        assert_eq!(parse_token_cookie(raw), Some("abc.def.ghi".to_string()));
    }

    #[test]
    fn non_token_cookies_are_ignored() {
        assert_eq!(parse_token_cookie("session=xyz; Path=/"), None);
        assert_eq!(parse_token_cookie("token=; Path=/"), None);
    }

    #[test]
    fn token_cookie_not_first_segment_is_found() {
        let raw = "Path=/; token=tok-123";
        assert_eq!(parse_token_cookie(raw), Some("tok-123".to_string()));
    }
}
