//! Names and defaults shared across modules. Centralized here so meta
//! container naming stays consistent between the registry, auth, and the
//! group manager.

pub const META_PREFIX: &str = "__meta__/";
pub const META_USERS_PREFIX: &str = "__meta__/users/";
pub const META_SESSIONS: &str = "__meta__/sessions";
pub const META_SESSION_LAST_COMMAND: &str = "__meta__/session_last_command";
pub const META_GROUPS_PREFIX: &str = "__meta__/groups/";

pub fn meta_user_container(user: &str) -> String {
    format!("{META_USERS_PREFIX}{user}")
}

pub fn meta_group_container(group: &str) -> String {
    format!("{META_GROUPS_PREFIX}{group}")
}

pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;
pub const DEFAULT_OUTBOUND_HIGH_WATERMARK: usize = 64 * 1024;
pub const DEFAULT_SNAPSHOT_BATCH: usize = 256;
pub const DEFAULT_EVENT_BATCH: usize = 512;
pub const DEFAULT_PORT: u16 = 2605;
pub const PROTOCOL_VERSION: &str = "1.0";
/// Bound on `wait_and_pop_next`'s poll loop (it runs on a worker thread, not
/// the reactor, so blocking here doesn't violate the non-blocking-accept
/// invariant); a client waiting longer than this gets `Timeout` and can
/// retry.
pub const WAIT_AND_POP_NEXT_TIMEOUT_MS: u64 = 5000;
pub const WAIT_AND_POP_NEXT_POLL_INTERVAL_MS: u64 = 20;
