use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{HeaderMap, Method};
use log::debug;
use tokio::time::sleep;

use crate::config::Config;
use crate::dns;

/// User agent pinned on every outbound request that does not carry one.
pub const USER_AGENT: &str = "go-docker-proxy/1.0";

/// Headers that apply to a single transport hop and must not be forwarded.
/// `Host` and `Content-Length` are rebuilt by the transport.
const SKIP_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "upgrade",
    "host",
    "content-length",
];

#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    /// Builds the outbound client. Redirects are disabled so the proxy can
    /// classify them itself; there is no total request timeout because blob
    /// streams may run for minutes.
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(30))
            .use_rustls_tls();

        if let Some(resolver) = dns::resolver_from_config(&config.dns) {
            builder = builder.dns_resolver(resolver);
        }

        Ok(Self {
            client: builder.build().context("Failed to build upstream HTTP client")?,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Builds the upstream request from the client request: method and URL
    /// preserved, headers copied minus hop-by-hop, `User-Agent` defaulted.
    /// Request bodies are not carried; the proxy is read-only.
    pub fn build_proxy_request(
        &self,
        method: Method,
        target_url: &str,
        client_headers: &HeaderMap,
    ) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, target_url);

        for (name, value) in client_headers {
            if SKIP_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            request = request.header(name, value);
        }

        if !client_headers.contains_key(reqwest::header::USER_AGENT) {
            request = request.header(reqwest::header::USER_AGENT, USER_AGENT);
        }

        request
    }

    /// Sends a request built by `make`, retrying transport errors with
    /// linear backoff (0 ms, 100 ms, 200 ms, ...).
    pub async fn send_with_retry(
        &self,
        make: impl Fn() -> reqwest::RequestBuilder,
        max_attempts: usize,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                debug!("upstream retry attempt {}/{max_attempts}", attempt + 1);
                sleep(Duration::from_millis(100 * attempt as u64)).await;
            }

            match make().send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    debug!("upstream request error (attempt {}): {error}", attempt + 1);
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.expect("at least one attempt"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{blocked_host_patterns, build_routes, DnsConfig};
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config {
            port: 8080,
            cache_dir: PathBuf::from("./cache"),
            cache_enabled: true,
            manifest_ttl: Duration::from_secs(3600),
            blob_ttl: Duration::from_secs(3600),
            follow_all_redirects: false,
            debug: false,
            custom_domain: "example.com".to_string(),
            routes: build_routes("example.com"),
            blocked_host_patterns: blocked_host_patterns(None),
            dns: DnsConfig::default(),
            target_upstream: None,
        }
    }

    #[tokio::test]
    async fn proxy_request_filters_hop_by_hop_headers() {
        let upstream = UpstreamClient::new(&test_config()).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("accept", "application/json".parse().unwrap());
        headers.insert("authorization", "Bearer token".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("proxy-connection", "keep-alive".parse().unwrap());
        headers.insert("upgrade", "h2c".parse().unwrap());
        headers.insert("host", "docker.example.com".parse().unwrap());
        headers.insert("content-length", "17".parse().unwrap());

        let request = upstream
            .build_proxy_request(Method::GET, "https://upstream.test/v2/", &headers)
            .build()
            .unwrap();

        assert_eq!(request.headers().get("accept").unwrap(), "application/json");
        assert_eq!(request.headers().get("authorization").unwrap(), "Bearer token");
        assert!(request.headers().get("connection").is_none());
        assert!(request.headers().get("proxy-connection").is_none());
        assert!(request.headers().get("upgrade").is_none());
        assert!(request.headers().get("host").is_none());
        assert!(request.headers().get("content-length").is_none());
        assert_eq!(request.headers().get("user-agent").unwrap(), USER_AGENT);
    }

    #[tokio::test]
    async fn proxy_request_keeps_client_user_agent() {
        let upstream = UpstreamClient::new(&test_config()).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("user-agent", "docker/27.0".parse().unwrap());

        let request = upstream
            .build_proxy_request(Method::HEAD, "https://upstream.test/v2/", &headers)
            .build()
            .unwrap();

        assert_eq!(request.headers().get("user-agent").unwrap(), "docker/27.0");
    }
}
