use log::debug;

use crate::config::Config;

/// Maps an inbound Host header (port stripped) to the configured upstream
/// base URL. In debug mode an unmatched host may fall back to
/// `TARGET_UPSTREAM`.
pub fn route_by_host<'a>(config: &'a Config, host: &str) -> Option<&'a str> {
    let bare_host = host.split(':').next().unwrap_or(host);

    if let Some(upstream) = config.routes.get(bare_host) {
        debug!("route matched: {host} -> {upstream}");
        return Some(upstream);
    }

    if config.debug {
        debug!("no route found for host: {host}");
        if let Some(target) = config.target_upstream.as_deref() {
            debug!("using TARGET_UPSTREAM fallback: {target}");
            return Some(target);
        }
    }

    None
}

/// Docker Hub addresses single-segment image names as `library/<name>`.
/// A `/v2/<name>/<kind>/<ref>` path (exactly three segments after `/v2/`)
/// is redirected once to its `library/` form, and the rewritten URL is what
/// enters the cache.
pub fn library_redirect_path(path: &str) -> Option<String> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() == 5 && parts[0].is_empty() && parts[1] == "v2" {
        let rewritten = format!("/v2/library/{}/{}/{}", parts[2], parts[3], parts[4]);
        debug!("docker hub library redirect: {path} -> {rewritten}");
        return Some(rewritten);
    }
    None
}

/// Token scopes follow the same convention: `repository:<name>:<action>`
/// with no slash in the name becomes `repository:library/<name>:<action>`.
pub fn rewrite_docker_hub_scope(scope: &str) -> String {
    let parts: Vec<&str> = scope.split(':').collect();
    if parts.len() == 3 && !parts[1].contains('/') {
        let rewritten = format!("{}:library/{}:{}", parts[0], parts[1], parts[2]);
        debug!("docker hub scope rewrite: {scope} -> {rewritten}");
        return rewritten;
    }
    scope.to_string()
}

pub fn is_docker_hub(upstream: &str) -> bool {
    upstream.contains("registry-1.docker.io")
}

pub fn is_blocked_host(patterns: &[String], host: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    patterns.iter().any(|pattern| host.contains(pattern))
}
