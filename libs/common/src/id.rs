use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = chat_common::id::prefixed_ulid("conn");
/// assert!(id.starts_with("conn_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// One physical WebSocket connection.
    pub const CONNECTION: &str = "conn";
    /// Single-use WebSocket upgrade ticket.
    pub const WS_TICKET: &str = "wst";
}
