use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use crate::config::DnsConfig;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Resolver handle applied to the outbound client when DNS overrides are
/// enabled. Lookups run through the platform resolver with the configured
/// timeout; the server list itself is deployment plumbing (resolv.conf or
/// equivalent) and is only validated and logged here.
pub struct TimeoutResolver {
    timeout: Duration,
}

impl Resolve for TimeoutResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let timeout = self.timeout;
        Box::pin(async move {
            let host = format!("{}:0", name.as_str());
            let addrs = tokio::time::timeout(timeout, tokio::net::lookup_host(host))
                .await
                .map_err(|e| Box::new(e) as BoxError)?
                .map_err(|e| Box::new(e) as BoxError)?;
            let addrs: Addrs = Box::new(addrs.collect::<Vec<SocketAddr>>().into_iter());
            Ok(addrs)
        })
    }
}

pub fn resolver_from_config(config: &DnsConfig) -> Option<Arc<TimeoutResolver>> {
    if !config.enabled {
        return None;
    }

    if config.servers.is_empty() {
        warn!("DNS_ENABLED=true but no DNS_SERVERS configured, using system resolver");
        return None;
    }

    info!(
        "DNS override enabled, servers: {:?}, timeout: {:?}",
        config.servers, config.timeout
    );
    Some(Arc::new(TimeoutResolver {
        timeout: config.timeout,
    }))
}
