//! Canonical stream and group names of a default deployment

/// Chat messages, keyed by sender id
pub const MESSAGES: &str = "messages";

/// Banned-word registrations, keyed by the word
pub const BANNED_WORDS: &str = "banned-words";

/// Block commands, keyed by the blocking user
pub const BLOCKED_USERS: &str = "blocked-users";

/// Filtered messages, keyed by receiver id
pub const FILTERED_MESSAGES: &str = "filtered-messages";

/// Group maintaining the per-receiver block lists
pub const BLOCKED_USERS_GROUP: &str = "blocked-users-group";

/// Group maintaining the banned-word table
pub const BANNED_WORDS_GROUP: &str = "group-banned-words";

/// Group filtering and masking chat messages
pub const FILTERED_MESSAGES_GROUP: &str = "filtered-messages-group";
