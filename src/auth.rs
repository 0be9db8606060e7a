use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use reqwest::Url;

use crate::error::ProxyError;

/// Service identity advertised in the proxy's own bearer challenge.
pub const SERVICE_NAME: &str = "go-docker-proxy";

fn challenge_param_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("challenge parameter regex"))
}

/// Parses a `WWW-Authenticate` header into its `key="value"` parameters.
/// `realm` is mandatory; a challenge without one is an upstream protocol
/// violation.
pub fn parse_www_authenticate(header: &str) -> Result<HashMap<String, String>, ProxyError> {
    let mut params = HashMap::new();
    for capture in challenge_param_regex().captures_iter(header) {
        params.insert(capture[1].to_string(), capture[2].to_string());
    }

    if !params.contains_key("realm") {
        return Err(ProxyError::BadAuthChallenge(header.to_string()));
    }

    Ok(params)
}

/// The challenge the proxy emits in place of the upstream's: the realm
/// points back at the proxy's own token endpoint. The host keeps its port
/// only in debug mode.
pub fn challenge_header(scheme: &str, host: &str, debug: bool) -> String {
    let host = if debug {
        host
    } else {
        host.split(':').next().unwrap_or(host)
    };
    format!(r#"Bearer realm="{scheme}://{host}/v2/auth",service="{SERVICE_NAME}""#)
}

/// Token endpoint URL: the original challenge's realm with `service` and
/// `scope` as query parameters.
pub fn token_url(
    params: &HashMap<String, String>,
    scope: Option<&str>,
) -> Result<Url, ProxyError> {
    let realm = params
        .get("realm")
        .ok_or_else(|| ProxyError::BadAuthChallenge("missing realm".to_string()))?;
    let mut url = Url::parse(realm)
        .map_err(|e| ProxyError::BadAuthChallenge(format!("invalid realm '{realm}': {e}")))?;

    {
        let mut query = url.query_pairs_mut();
        if let Some(service) = params.get("service").filter(|s| !s.is_empty()) {
            query.append_pair("service", service);
        }
        if let Some(scope) = scope.filter(|s| !s.is_empty()) {
            query.append_pair("scope", scope);
        }
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_hub_challenge() {
        let params = parse_www_authenticate(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io""#,
        )
        .unwrap();
        assert_eq!(
            params.get("realm").map(String::as_str),
            Some("https://auth.docker.io/token")
        );
        assert_eq!(
            params.get("service").map(String::as_str),
            Some("registry.docker.io")
        );
    }

    #[test]
    fn missing_realm_is_an_error() {
        let err = parse_www_authenticate(r#"Bearer service="registry.docker.io""#).unwrap_err();
        assert!(err.to_string().contains("WWW-Authenticate"));
    }

    #[test]
    fn challenge_header_strips_port_outside_debug() {
        assert_eq!(
            challenge_header("http", "docker.example.com:8080", false),
            r#"Bearer realm="http://docker.example.com/v2/auth",service="go-docker-proxy""#
        );
        assert_eq!(
            challenge_header("https", "docker.example.com:8080", true),
            r#"Bearer realm="https://docker.example.com:8080/v2/auth",service="go-docker-proxy""#
        );
    }

    #[test]
    fn token_url_carries_service_and_scope() {
        let mut params = HashMap::new();
        params.insert("realm".to_string(), "https://auth.docker.io/token".to_string());
        params.insert("service".to_string(), "registry.docker.io".to_string());

        let url = token_url(&params, Some("repository:library/nginx:pull")).unwrap();
        assert_eq!(url.host_str(), Some("auth.docker.io"));
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&("service".to_string(), "registry.docker.io".to_string())));
        assert!(query.contains(&(
            "scope".to_string(),
            "repository:library/nginx:pull".to_string()
        )));
    }

    #[test]
    fn token_url_rejects_bad_realm() {
        let mut params = HashMap::new();
        params.insert("realm".to_string(), "not a url".to_string());
        assert!(token_url(&params, None).is_err());
    }
}
