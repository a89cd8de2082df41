//! MCP protocol types (JSON-RPC 2.0 framing plus the tool surface)

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// Newest protocol version spoken by the stateless transport
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions accepted during `initialize`, newest first.
///
/// `2024-11-05` is the generation that used the SSE + POST transport pairing.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Pick the protocol version to answer an `initialize` with.
///
/// Echoes the client's version when supported, otherwise falls back to the
/// newest version this server speaks.
#[must_use]
pub fn negotiate_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == requested)
        .copied()
        .unwrap_or(PROTOCOL_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_echoes_supported_versions() {
        assert_eq!(negotiate_version("2024-11-05"), "2024-11-05");
        assert_eq!(negotiate_version("2025-03-26"), "2025-03-26");
    }

    #[test]
    fn negotiate_falls_back_to_latest() {
        assert_eq!(negotiate_version("1999-01-01"), PROTOCOL_VERSION);
        assert_eq!(negotiate_version(""), PROTOCOL_VERSION);
    }
}
