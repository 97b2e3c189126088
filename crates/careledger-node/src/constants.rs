pub(crate) const ANCHOR_QUEUE_DEPTH: usize = 256;
pub(crate) const BACKGROUND_RETRY_LIMIT: u32 = 3;
pub(crate) const BACKGROUND_RETRY_BACKOFF_MS: u64 = 250;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const ACTOR_HEADER: &str = "x-actor-id";
