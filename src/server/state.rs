use std::sync::Arc;
use std::time::Instant;

use crate::cache::CacheManager;
use crate::config::Config;
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<CacheManager>,
    pub upstream: UpstreamClient,
    pub start_time: Instant,
}
