//! HTTP client for chart downloads
//!
//! - Redirects are followed manually and credentials are only sent to the
//!   origin the request started on
//! - Bodies are read chunk by chunk and abandoned once they exceed the
//!   configured size limit
//! - TLS verification can be disabled per chart

use compositor_core::ResolvedCredentials;
use std::time::Duration;
use url::Url;

use crate::error::{RepoError, Result};

const MAX_REDIRECTS: u32 = 10;

/// Download settings shared by every request of one resolution
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Largest body accepted, in bytes
    pub max_size: u64,
    /// Per-request timeout
    pub timeout: Duration,
    /// Accept any server certificate
    pub insecure_skip_verify_tls: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_size: crate::DEFAULT_MAX_CHART_SIZE,
            timeout: Duration::from_secs(30),
            insecure_skip_verify_tls: false,
        }
    }
}

/// HTTP client that never leaks credentials across origins
pub struct ChartHttpClient {
    client: reqwest::Client,
    credentials: Option<ResolvedCredentials>,
    max_size: u64,
}

impl ChartHttpClient {
    pub fn new(options: &ClientOptions, credentials: Option<ResolvedCredentials>) -> Result<Self> {
        let client = reqwest::Client::builder()
            // Redirects are handled in `get` so auth can be dropped cross-origin
            .redirect(reqwest::redirect::Policy::none())
            .timeout(options.timeout)
            .danger_accept_invalid_certs(options.insecure_skip_verify_tls)
            .build()
            .map_err(|e| RepoError::NetworkError {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            credentials,
            max_size: options.max_size,
        })
    }

    /// Fetch a URL, following redirects
    pub async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let original = Url::parse(url).map_err(|e| RepoError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let mut current = original.clone();
        let mut redirects = 0;

        loop {
            let mut request = self.client.get(current.clone());
            match &self.credentials {
                Some(creds) if same_origin(&original, &current) => {
                    request = request.header(reqwest::header::AUTHORIZATION, basic_auth(creds));
                }
                Some(_) => {
                    tracing::warn!(
                        from = %original,
                        to = %current,
                        "Cross-origin redirect, credentials not forwarded"
                    );
                }
                None => {}
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_redirection() {
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(RepoError::NetworkError {
                        message: format!("Too many redirects (max {})", MAX_REDIRECTS),
                    });
                }
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| RepoError::NetworkError {
                        message: "Redirect without Location header".to_string(),
                    })?;
                current = current.join(location)?;
                continue;
            }

            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(RepoError::NotFound {
                    url: current.to_string(),
                });
            }
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(RepoError::AuthFailed {
                    message: format!("{} returned {}", current, status.as_u16()),
                });
            }
            if !status.is_success() {
                return Err(RepoError::HttpError {
                    status: status.as_u16(),
                    message: format!("Request to {} failed", current),
                });
            }

            return Ok(response);
        }
    }

    /// Fetch a body, enforcing the size limit
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self.get(url).await?;

        if let Some(size) = response.content_length()
            && size > self.max_size
        {
            return Err(RepoError::SizeLimitExceeded {
                size,
                limit: self.max_size,
            });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);
            if body.len() as u64 > self.max_size {
                return Err(RepoError::SizeLimitExceeded {
                    size: body.len() as u64,
                    limit: self.max_size,
                });
            }
        }
        Ok(body)
    }
}

/// Same scheme, host and port
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

fn basic_auth(creds: &ResolvedCredentials) -> String {
    let encoded = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        format!("{}:{}", creds.username, creds.password),
    );
    format!("Basic {}", encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_same_origin() {
        assert!(same_origin(
            &url("https://charts.example.com/a.tgz"),
            &url("https://charts.example.com:443/b/c.tgz")
        ));
        assert!(!same_origin(
            &url("https://charts.example.com/a.tgz"),
            &url("https://cdn.example.com/a.tgz")
        ));
        assert!(!same_origin(
            &url("https://charts.example.com/a.tgz"),
            &url("http://charts.example.com/a.tgz")
        ));
        assert!(!same_origin(
            &url("https://charts.example.com/a.tgz"),
            &url("https://charts.example.com:8443/a.tgz")
        ));
    }

    #[test]
    fn test_basic_auth_header() {
        let creds = ResolvedCredentials {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        assert_eq!(basic_auth(&creds), "Basic dXNlcjpwYXNz");
    }
}
