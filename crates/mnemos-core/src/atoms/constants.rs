// Shared constants for the memory engine.

/// Directory under the platform data dir.
pub const DATA_DIR_NAME: &str = "mnemos";
pub const DATABASE_FILE: &str = "mnemos.db";

/// Default BFS depth for graph traversal.
pub const DEFAULT_MAX_HOPS: usize = 2;
/// Hard ceiling on traversal depth accepted from config or callers.
pub const MAX_HOPS_LIMIT: usize = 6;

/// Confidence added when an active edge is corroborated.
pub const CORROBORATION_BOOST: f32 = 0.05;

/// Current sealed-blob format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// OS keychain coordinates for the master secret.
pub const KEYRING_SERVICE: &str = "mnemos-memory-vault";
pub const KEYRING_USER: &str = "master-secret";

/// Subject used for first-person facts ("my", "I").
pub const USER_ENTITY: &str = "user";

/// Highlights kept in the user profile.
pub const PROFILE_HIGHLIGHTS: usize = 5;
