use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    RouteNotFound(String),
    UpstreamUnavailable(String),
    RedirectLoop(String),
    BadAuthChallenge(String),
    RequestCancelled,
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::RouteNotFound(host) => {
                write!(f, "no upstream route configured for host '{host}'")
            }
            ProxyError::UpstreamUnavailable(msg) => write!(f, "{msg}"),
            ProxyError::RedirectLoop(url) => {
                write!(f, "too many redirects while following {url}")
            }
            ProxyError::BadAuthChallenge(header) => {
                write!(f, "invalid WWW-Authenticate header: {header}")
            }
            ProxyError::RequestCancelled => write!(f, "request cancelled"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            ProxyError::UpstreamUnavailable(format!("upstream connection failed: {err}"))
        } else if err.is_timeout() {
            ProxyError::UpstreamUnavailable(format!("upstream timed out: {err}"))
        } else {
            ProxyError::UpstreamUnavailable(format!("transport error: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert!(ProxyError::RouteNotFound("docker.test".into())
            .to_string()
            .contains("docker.test"));
        assert!(ProxyError::RedirectLoop("https://x/y".into())
            .to_string()
            .contains("too many redirects"));
        assert!(ProxyError::BadAuthChallenge("Bearer foo".into())
            .to_string()
            .contains("WWW-Authenticate"));
        assert!(ProxyError::RequestCancelled
            .to_string()
            .contains("cancelled"));
    }
}
