// -
// Server defaults

pub(crate) const DEFAULT_SERVER_NAME: &str = "PropertyServer";

/// Hard ceiling on outstanding requests per server.
pub(crate) const MAX_OUTSTANDING_REQUESTS: usize = 65536;

pub(crate) const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

// -
// Response tracker housekeeping

pub(crate) const TRACKER_CLEANUP_THRESHOLD: usize = 256;
pub(crate) const TRACKER_CLEANUP_INTERVAL_MS: u64 = 30_000;

// -
// Failure messages

pub(crate) const MSG_KEY_IS_EMPTY: &str = "Key is empty.";
pub(crate) const MSG_NULL_MODIFY_VALUE: &str = "Value is null for modify request.";
pub(crate) const MSG_REQUEST_CANCELLED: &str = "Request cancelled.";
pub(crate) const MSG_PROPERTY_RESET: &str = "Property reset.";
pub(crate) const MSG_RESPONSE_TYPE_MISMATCH: &str = "Response type mismatch.";
