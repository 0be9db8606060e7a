use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, HOST, LOCATION,
    RANGE, USER_AGENT, WWW_AUTHENTICATE,
};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use log::{debug, warn};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::auth;
use crate::cache::inflight::{Completer, Flight, FlightOutcome};
use crate::cache::key::cache_key;
use crate::cache::{is_cacheable, CacheEntry, Descriptor};
use crate::routing;
use crate::server::error::{routes_response, ErrorResponse};
use crate::server::state::AppState;
use crate::upstream;

/// Responses with a declared length above this are streamed through without
/// buffering; below it the body is read fully and admitted to the cache.
const MAX_CACHEABLE_SIZE: u64 = 50 * 1024 * 1024;
const STREAM_BUFFER_SIZE: usize = 256 * 1024;
const MAX_REDIRECTS: usize = 10;
const PROBE_ATTEMPTS: usize = 3;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Hop-by-hop headers stripped from upstream responses. Transfer-Encoding
/// is rebuilt by the server's own transport.
const SKIP_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "upgrade",
    "transfer-encoding",
];

pub async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": format_uptime(state.start_time.elapsed()),
    }))
    .into_response()
}

pub async fn stats(State(state): State<AppState>) -> Response {
    Json(json!({
        "uptime": format_uptime(state.start_time.elapsed()),
        "enabled": state.config.cache_enabled,
        "cache": state.cache.stats_snapshot(),
    }))
    .into_response()
}

pub async fn cache_stats(State(state): State<AppState>) -> Response {
    Json(json!({
        "config": {
            "directory": state.config.cache_dir.display().to_string(),
            "manifestTTL": format_uptime(state.config.manifest_ttl),
            "blobTTL": format_uptime(state.config.blob_ttl),
            "enabled": state.config.cache_enabled,
        },
        "stats": state.cache.stats_snapshot(),
    }))
    .into_response()
}

pub async fn root(State(state): State<AppState>, headers: HeaderMap, uri: Uri) -> Response {
    let host = request_host(&headers, &uri);
    if routing::route_by_host(&state.config, &host).is_none() {
        return routes_response(&state.config.routes);
    }
    redirect_response(StatusCode::MOVED_PERMANENTLY, "/v2/")
}

/// Probes the upstream's `/v2/` and mirrors its 401 as the proxy's own
/// challenge so clients negotiate tokens through `/v2/auth`.
pub async fn v2_root(State(state): State<AppState>, headers: HeaderMap, uri: Uri) -> Response {
    let host = request_host(&headers, &uri);
    let Some(upstream_base) = routing::route_by_host(&state.config, &host).map(str::to_string)
    else {
        debug!("no upstream found for host: {host}");
        return routes_response(&state.config.routes);
    };

    debug!("/v2/ probe for host {host} -> {upstream_base}");
    let target = format!("{upstream_base}/v2/");

    let response = match state
        .upstream
        .send_with_retry(
            || state
                .upstream
                .build_proxy_request(Method::GET, &target, &headers),
            PROBE_ATTEMPTS,
        )
        .await
    {
        Ok(response) => response,
        Err(error) => {
            return ErrorResponse::bad_gateway(format!(
                "upstream connection failed after {PROBE_ATTEMPTS} attempts: {error}"
            ))
            .into_response()
        }
    };

    debug!("/v2/ upstream status: {}", response.status());
    if response.status() == StatusCode::UNAUTHORIZED {
        return unauthorized_response(&state, &headers, &host);
    }

    copy_response(response)
}

/// Issues the token request on the client's behalf: recover the upstream's
/// original challenge, rewrite Docker Hub scopes, fetch from the realm and
/// relay the result verbatim.
pub async fn v2_auth(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let host = request_host(&headers, &uri);
    let Some(upstream_base) = routing::route_by_host(&state.config, &host).map(str::to_string)
    else {
        debug!("/v2/auth no upstream found for host: {host}");
        return routes_response(&state.config.routes);
    };

    let scope = params.get("scope").cloned();
    debug!("/v2/auth host {host} upstream {upstream_base} scope {scope:?}");

    let target = format!("{upstream_base}/v2/");
    let probe = match state
        .upstream
        .send_with_retry(
            || state
                .upstream
                .build_proxy_request(Method::GET, &target, &headers),
            PROBE_ATTEMPTS,
        )
        .await
    {
        Ok(response) => response,
        Err(error) => {
            return ErrorResponse::bad_gateway(format!(
                "upstream connection failed after {PROBE_ATTEMPTS} attempts: {error}"
            ))
            .into_response()
        }
    };

    if probe.status() != StatusCode::UNAUTHORIZED {
        debug!("/v2/auth unexpected upstream status: {}", probe.status());
        return copy_response(probe);
    }

    let Some(challenge) = probe
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
    else {
        debug!("/v2/auth upstream 401 without WWW-Authenticate");
        return copy_response(probe);
    };
    debug!("/v2/auth upstream challenge: {challenge}");

    let challenge_params = match auth::parse_www_authenticate(&challenge) {
        Ok(params) => params,
        Err(error) => return ErrorResponse::from(error).into_response(),
    };

    let scope = scope.map(|scope| {
        if routing::is_docker_hub(&upstream_base) {
            routing::rewrite_docker_hub_scope(&scope)
        } else {
            scope
        }
    });

    let token_url = match auth::token_url(&challenge_params, scope.as_deref()) {
        Ok(url) => url,
        Err(error) => return ErrorResponse::from(error).into_response(),
    };

    let mut token_request = state
        .upstream
        .client()
        .get(token_url)
        .header(USER_AGENT, upstream::USER_AGENT);
    if let Some(authorization) = headers.get(AUTHORIZATION) {
        token_request = token_request.header(AUTHORIZATION, authorization);
    }

    match token_request.send().await {
        Ok(response) => {
            debug!("/v2/auth token endpoint status: {}", response.status());
            copy_response(response)
        }
        Err(error) => ErrorResponse::internal(format!("token fetch failed: {error}")).into_response(),
    }
}

/// The registry API proper: route, rewrite, consult the cache, coalesce
/// concurrent misses, then proxy.
pub async fn v2_dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path().to_string();
    let host = request_host(&headers, &uri);
    let Some(upstream_base) = routing::route_by_host(&state.config, &host).map(str::to_string)
    else {
        debug!("no upstream found for host {host}, path {path}");
        return routes_response(&state.config.routes);
    };

    debug!("{method} {host}{path} -> {upstream_base}");

    if routing::is_docker_hub(&upstream_base) {
        if let Some(rewritten) = routing::library_redirect_path(&path) {
            return redirect_response(StatusCode::MOVED_PERMANENTLY, &rewritten);
        }
    }

    let key = cache_key(&host, &path);
    let cacheable = is_cacheable(&path);
    let blob_request = path.contains("/blobs/");
    let cache_enabled = state.config.cache_enabled;

    if cache_enabled && cacheable {
        if let Some(response) = serve_from_cache(&state, &key, blob_request).await {
            debug!("cache hit: {path}");
            return response;
        }
        debug!("cache miss: {path}");
    }

    let target = match uri.query() {
        Some(query) => format!("{upstream_base}{path}?{query}"),
        None => format!("{upstream_base}{path}"),
    };

    if cache_enabled && cacheable && method == Method::GET {
        match state.cache.inflight().try_start(&key) {
            Flight::First(completer) => {
                return proxy_request(
                    &state,
                    &method,
                    &headers,
                    &host,
                    &target,
                    &key,
                    true,
                    Some(completer),
                )
                .await;
            }
            Flight::Follower(waiter) => {
                debug!("waiting for inflight request: {path}");
                let cancel = CancellationToken::new();
                let outcome = match waiter.wait(&cancel).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        return ErrorResponse::new(
                            StatusCode::REQUEST_TIMEOUT,
                            "request cancelled",
                        )
                        .into_response()
                    }
                };

                if outcome.cached {
                    if let Some(response) = serve_from_cache(&state, &key, blob_request).await {
                        debug!("inflight cache hit: {path}");
                        return response;
                    }
                }

                // The first caller failed to establish a cache entry; fall
                // back to a direct, non-caching fetch without re-entering
                // the coalescer.
                debug!("inflight fallback to direct request: {path}");
                return proxy_request(&state, &method, &headers, &host, &target, "", false, None)
                    .await;
            }
        }
    }

    proxy_request(&state, &method, &headers, &host, &target, &key, true, None).await
}

#[allow(clippy::too_many_arguments)]
async fn proxy_request(
    state: &AppState,
    method: &Method,
    client_headers: &HeaderMap,
    host: &str,
    target: &str,
    cache_key: &str,
    enable_cache: bool,
    completer: Option<Completer>,
) -> Response {
    debug!("proxy request to {target}");

    let request = state
        .upstream
        .build_proxy_request(method.clone(), target, client_headers);
    let response = match request.send().await {
        Ok(response) => response,
        Err(error) => {
            return ErrorResponse::bad_gateway(format!("transport error: {error}")).into_response()
        }
    };

    debug!("upstream response {} from {target}", response.status());

    if response.status() == StatusCode::UNAUTHORIZED {
        return unauthorized_response(state, client_headers, host);
    }

    if is_redirect(response.status()) {
        if let Some(location) = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
        {
            debug!("upstream redirect {} to {location}", response.status());
            if let Ok(redirect_url) = reqwest::Url::parse(location) {
                let redirect_host = redirect_url.host_str().unwrap_or("");
                let follow = state.config.follow_all_redirects
                    || routing::is_blocked_host(&state.config.blocked_host_patterns, redirect_host);
                if follow {
                    return follow_redirect(
                        state,
                        client_headers,
                        redirect_url,
                        cache_key,
                        enable_cache,
                        method,
                        completer,
                    )
                    .await;
                }
                // Reachable host: hand the signed URL back to the client
                // untouched so its signature stays valid.
                debug!("returning redirect to client: {redirect_host}");
            }
        }
        return copy_response(response);
    }

    let should_store = enable_cache && state.config.cache_enabled && is_cacheable(cache_key);
    copy_response_with_cache(state, response, method, cache_key, should_store, completer).await
}

/// Server-side redirect follow for blocked or force-followed targets: a
/// fresh unauthenticated GET carrying only `Accept` and `Range` (signed
/// URLs embed their own credential), at most `MAX_REDIRECTS` hops deep.
async fn follow_redirect(
    state: &AppState,
    original_headers: &HeaderMap,
    mut target: reqwest::Url,
    cache_key: &str,
    enable_cache: bool,
    method: &Method,
    completer: Option<Completer>,
) -> Response {
    for hop in 0..MAX_REDIRECTS {
        debug!("following redirect ({}/{MAX_REDIRECTS}): {target}", hop + 1);

        let mut request = state
            .upstream
            .client()
            .get(target.clone())
            .header(USER_AGENT, upstream::USER_AGENT);
        if let Some(accept) = original_headers.get(ACCEPT) {
            request = request.header(ACCEPT, accept);
        }
        if let Some(range) = original_headers.get(RANGE) {
            request = request.header(RANGE, range);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                return ErrorResponse::bad_gateway(format!("redirect request failed: {error}"))
                    .into_response()
            }
        };

        debug!("redirect response status: {}", response.status());

        if is_redirect(response.status()) {
            if let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
            {
                if let Ok(next) = target.join(location) {
                    target = next;
                    continue;
                }
            }
        }

        let should_store =
            enable_cache && state.config.cache_enabled && !cache_key.is_empty();
        return copy_response_with_cache(state, response, method, cache_key, should_store, completer)
            .await;
    }

    warn!("too many redirects while following {target}");
    ErrorResponse::bad_gateway("too many redirects").into_response()
}

#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Buffer,
    Bypass,
}

fn admission_decision(content_length: Option<u64>) -> Admission {
    match content_length {
        Some(length) if length <= MAX_CACHEABLE_SIZE => Admission::Buffer,
        _ => Admission::Bypass,
    }
}

/// Copies an upstream response to the client, admitting small 200 bodies to
/// the cache. The cache write runs on its own task so the client never
/// waits on disk; the inflight completer resolves when that write settles.
async fn copy_response_with_cache(
    state: &AppState,
    response: reqwest::Response,
    method: &Method,
    cache_key: &str,
    should_store: bool,
    completer: Option<Completer>,
) -> Response {
    let status = response.status();
    let mut headers = filter_response_headers(response.headers());

    // HEAD responses carry no body and are never cached
    if method == Method::HEAD {
        return build_response(status, headers, Body::empty());
    }

    if !should_store || status != StatusCode::OK {
        return build_response(status, headers, Body::from_stream(response.bytes_stream()));
    }

    let content_length = response.content_length().or_else(|| {
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    });

    if admission_decision(content_length) == Admission::Bypass {
        debug!(
            "streaming without cache (content length {content_length:?}): {cache_key}"
        );
        headers.insert(X_CACHE, HeaderValue::from_static("BYPASS"));
        return build_response(status, headers, Body::from_stream(response.bytes_stream()));
    }

    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(error) => {
            debug!("failed reading upstream body for {cache_key}: {error}");
            return build_response(status, headers, Body::empty());
        }
    };

    // only 200s with non-empty bodies are admitted
    if bytes.is_empty() {
        debug!("skipping cache for empty response: {cache_key}");
        return build_response(status, headers, Body::empty());
    }

    headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len() as u64));
    let captured = headers_to_map(&headers);
    headers.insert(X_CACHE, HeaderValue::from_static("MISS"));

    let media_type = captured
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .and_then(|(_, values)| values.first())
        .cloned()
        .unwrap_or_default();

    let now = Utc::now();
    let entry = CacheEntry {
        descriptor: Descriptor {
            digest: String::new(),
            size: bytes.len() as u64,
            media_type,
        },
        headers: captured,
        status_code: status.as_u16(),
        data: Some(bytes.to_vec()),
        body_path: None,
        cached_at: now,
        expires_at: now,
    };

    let cache = state.cache.clone();
    let key = cache_key.to_string();
    tokio::spawn(async move {
        let cached = match cache.put(&key, entry).await {
            Ok(()) => true,
            Err(error) => {
                debug!("cache put failed for {key}: {error}");
                false
            }
        };
        if let Some(completer) = completer {
            completer.done(FlightOutcome { cached });
        }
    });

    build_response(status, headers, Body::from(bytes))
}

async fn serve_from_cache(state: &AppState, key: &str, blob_request: bool) -> Option<Response> {
    if blob_request {
        let (entry, file) = state.cache.get_blob_reader(key).await?;
        let mut headers = map_to_headers(&entry.headers);
        headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
        let stream = ReaderStream::with_capacity(file, STREAM_BUFFER_SIZE);
        Some(build_response(
            status_from(entry.status_code),
            headers,
            Body::from_stream(stream),
        ))
    } else {
        let entry = state.cache.get(key).await?;
        let mut headers = map_to_headers(&entry.headers);
        headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
        let body = entry.data.unwrap_or_default();
        Some(build_response(
            status_from(entry.status_code),
            headers,
            Body::from(body),
        ))
    }
}

fn unauthorized_response(state: &AppState, headers: &HeaderMap, host: &str) -> Response {
    let scheme = request_scheme(headers);
    let challenge = auth::challenge_header(scheme, host, state.config.debug);

    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "UNAUTHORIZED" })),
    )
        .into_response();
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_str(&challenge).unwrap_or(HeaderValue::from_static("Bearer")),
    );
    response
}

fn copy_response(response: reqwest::Response) -> Response {
    let status = response.status();
    let headers = filter_response_headers(response.headers());
    build_response(status, headers, Body::from_stream(response.bytes_stream()))
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn status_from(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::OK)
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

fn request_host(headers: &HeaderMap, uri: &Uri) -> String {
    headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|authority| authority.to_string()))
        .unwrap_or_default()
}

/// Effective scheme for self-referential URLs. TLS terminates in front of
/// the proxy, so the forwarded proto wins when present.
fn request_scheme(headers: &HeaderMap) -> &'static str {
    match headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
    {
        Some("https") => "https",
        _ => "http",
    }
}

fn filter_response_headers(upstream_headers: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream_headers {
        if SKIP_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name, value.clone());
    }
    headers
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

fn map_to_headers(map: &HashMap<String, Vec<String>>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in map {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers
}

fn redirect_response(status: StatusCode, location: &str) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}

fn format_uptime(duration: Duration) -> String {
    format!("{}s", duration.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_respects_the_size_threshold() {
        assert_eq!(admission_decision(Some(0)), Admission::Buffer);
        assert_eq!(
            admission_decision(Some(MAX_CACHEABLE_SIZE - 1)),
            Admission::Buffer
        );
        assert_eq!(
            admission_decision(Some(MAX_CACHEABLE_SIZE + 1)),
            Admission::Bypass
        );
        assert_eq!(admission_decision(None), Admission::Bypass);
    }

    #[test]
    fn redirect_statuses() {
        for code in [301u16, 302, 303, 307, 308] {
            assert!(is_redirect(StatusCode::from_u16(code).unwrap()));
        }
        assert!(!is_redirect(StatusCode::OK));
        assert!(!is_redirect(StatusCode::NOT_MODIFIED));
    }

    #[test]
    fn request_host_prefers_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "docker.example.com:8080".parse().unwrap());
        let uri: Uri = "/v2/".parse().unwrap();
        assert_eq!(request_host(&headers, &uri), "docker.example.com:8080");

        let uri: Uri = "http://quay.example.com/v2/".parse().unwrap();
        assert_eq!(request_host(&HeaderMap::new(), &uri), "quay.example.com");
    }

    #[test]
    fn request_scheme_honours_forwarded_proto() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_scheme(&headers), "http");
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        assert_eq!(request_scheme(&headers), "https");
    }

    #[test]
    fn response_header_filter_strips_hop_by_hop() {
        let mut upstream_headers = HeaderMap::new();
        upstream_headers.insert("content-type", "application/json".parse().unwrap());
        upstream_headers.insert("docker-content-digest", "sha256:abc".parse().unwrap());
        upstream_headers.insert("connection", "close".parse().unwrap());
        upstream_headers.insert("transfer-encoding", "chunked".parse().unwrap());
        upstream_headers.insert("upgrade", "h2c".parse().unwrap());

        let filtered = filter_response_headers(&upstream_headers);
        assert!(filtered.get("content-type").is_some());
        assert!(filtered.get("docker-content-digest").is_some());
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("transfer-encoding").is_none());
        assert!(filtered.get("upgrade").is_none());
    }

    #[test]
    fn header_map_round_trip() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.append("www-authenticate", "Bearer a".parse().unwrap());
        headers.append("www-authenticate", "Bearer b".parse().unwrap());

        let map = headers_to_map(&headers);
        assert_eq!(map["www-authenticate"].len(), 2);

        let rebuilt = map_to_headers(&map);
        assert_eq!(
            rebuilt
                .get_all("www-authenticate")
                .iter()
                .count(),
            2
        );
        assert_eq!(rebuilt.get("content-type").unwrap(), "application/json");
    }
}
