use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CACHE_DIR: &str = "./cache";
pub const DEFAULT_CUSTOM_DOMAIN: &str = "example.com";
pub const DOCKER_HUB_UPSTREAM: &str = "https://registry-1.docker.io";

const DEFAULT_MANIFEST_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_BLOB_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Host patterns that must be followed server-side: these registries park
/// blobs on hosts the proxy's clients cannot reach directly.
const DEFAULT_BLOCKED_HOST_PATTERNS: &[&str] =
    &["cloudflare.docker.com", "docker.com", "docker.io"];

pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_var(key) {
        Some(value) => value == "true",
        None => default,
    }
}

#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub enabled: bool,
    pub servers: Vec<String>,
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            servers: Vec::new(),
            timeout: DEFAULT_DNS_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub cache_enabled: bool,
    pub manifest_ttl: Duration,
    pub blob_ttl: Duration,
    pub follow_all_redirects: bool,
    pub debug: bool,
    pub custom_domain: String,
    pub routes: HashMap<String, String>,
    pub blocked_host_patterns: Vec<String>,
    pub dns: DnsConfig,
    pub target_upstream: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let custom_domain =
            env_var("CUSTOM_DOMAIN").unwrap_or_else(|| DEFAULT_CUSTOM_DOMAIN.to_string());

        let port = env_var("PORT")
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let manifest_ttl = parse_duration(
            env_var("CACHE_MANIFEST_TTL").as_deref().unwrap_or("1d"),
            DEFAULT_MANIFEST_TTL,
        );
        let blob_ttl = parse_duration(
            env_var("CACHE_BLOB_TTL").as_deref().unwrap_or("1y"),
            DEFAULT_BLOB_TTL,
        );

        Self {
            port,
            cache_dir: PathBuf::from(
                env_var("CACHE_DIR").unwrap_or_else(|| DEFAULT_CACHE_DIR.to_string()),
            ),
            cache_enabled: env_bool("CACHE_ENABLED", true),
            manifest_ttl,
            blob_ttl,
            follow_all_redirects: env_bool("FOLLOW_ALL_REDIRECTS", false),
            debug: env_bool("DEBUG", false),
            routes: build_routes(&custom_domain),
            custom_domain,
            blocked_host_patterns: blocked_host_patterns(env_var("BLOCKED_HOSTS").as_deref()),
            dns: DnsConfig {
                enabled: env_bool("DNS_ENABLED", false),
                servers: split_list(env_var("DNS_SERVERS").as_deref()),
                timeout: parse_duration(
                    env_var("DNS_TIMEOUT").as_deref().unwrap_or("5s"),
                    DEFAULT_DNS_TIMEOUT,
                ),
            },
            target_upstream: env_var("TARGET_UPSTREAM"),
        }
    }
}

/// Route table for the fixed registry label set under a custom domain,
/// e.g. `docker.example.com -> https://registry-1.docker.io`.
pub fn build_routes(custom_domain: &str) -> HashMap<String, String> {
    let labels: &[(&str, &str)] = &[
        ("docker", DOCKER_HUB_UPSTREAM),
        ("quay", "https://quay.io"),
        ("gcr", "https://gcr.io"),
        ("k8s-gcr", "https://k8s.gcr.io"),
        ("k8s", "https://registry.k8s.io"),
        ("ghcr", "https://ghcr.io"),
        ("cloudsmith", "https://docker.cloudsmith.io"),
        ("ecr", "https://public.ecr.aws"),
        // docker-staging is an alias of Docker Hub
        ("docker-staging", DOCKER_HUB_UPSTREAM),
    ];

    labels
        .iter()
        .map(|(label, upstream)| (format!("{label}.{custom_domain}"), upstream.to_string()))
        .collect()
}

pub fn blocked_host_patterns(extra: Option<&str>) -> Vec<String> {
    let mut patterns: Vec<String> = DEFAULT_BLOCKED_HOST_PATTERNS
        .iter()
        .map(|pattern| pattern.to_string())
        .collect();
    patterns.extend(split_list(extra));
    patterns
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Parses a duration string. Compound `h`/`m`/`s`/`ms` forms ("1h30m") are
/// accepted, plus single-suffix extended units: `d` (days), `w` (weeks),
/// `M` (30-day months), `y` (365-day years), all allowing fractions.
/// Anything unparseable falls back to `default`.
pub fn parse_duration(input: &str, default: Duration) -> Duration {
    let input = input.trim();
    if input.is_empty() {
        return default;
    }

    if let Some(duration) = parse_compound_duration(input) {
        return duration;
    }

    let (multiplier_secs, number) = match split_last_char(input) {
        Some(('y', rest)) => (365.0 * 24.0 * 3600.0, rest),
        Some(('M', rest)) => (30.0 * 24.0 * 3600.0, rest),
        Some(('w', rest)) => (7.0 * 24.0 * 3600.0, rest),
        Some(('d', rest)) => (24.0 * 3600.0, rest),
        _ => return default,
    };

    match number.trim().parse::<f64>() {
        Ok(value) if value >= 0.0 && value.is_finite() => {
            Duration::from_secs_f64(value * multiplier_secs)
        }
        _ => default,
    }
}

fn split_last_char(input: &str) -> Option<(char, &str)> {
    let last = input.chars().next_back()?;
    Some((last, &input[..input.len() - last.len_utf8()]))
}

fn parse_compound_duration(input: &str) -> Option<Duration> {
    let mut rest = input;
    let mut total = Duration::ZERO;
    let mut matched = false;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let (unit_secs, unit_len) = if rest.starts_with("ms") {
            (0.001, 2)
        } else if rest.starts_with('h') {
            (3600.0, 1)
        } else if rest.starts_with('m') {
            (60.0, 1)
        } else if rest.starts_with('s') {
            (1.0, 1)
        } else {
            return None;
        };
        rest = &rest[unit_len..];

        if !value.is_finite() || value < 0.0 {
            return None;
        }
        total += Duration::from_secs_f64(value * unit_secs);
        matched = true;
    }

    matched.then_some(total)
}
