//! Host string helpers.

use crate::config::NodeConfig;

/// Canonical form for host comparison: trimmed, lowercased, no trailing dot.
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Minimal syntactic check: a reachable host names a domain or an IP.
pub fn valid_host(host: &str) -> bool {
    let host = host.trim();
    !host.is_empty() && (host.contains('.') || host.contains(':'))
}

/// Does this host string refer to the local node itself?
pub fn is_self_host(node: &NodeConfig, host: &str) -> bool {
    let host = normalize_host(host);
    if host == normalize_host(&node.host) {
        return true;
    }
    // Bare hostname and loopback spellings
    let bare = node.host.trim_end_matches(".local").to_ascii_lowercase();
    host == bare
        || host == "localhost"
        || host == "127.0.0.1"
        || host == format!("localhost:{}", node.port)
        || host == format!("127.0.0.1:{}", node.port)
}

/// Base URL for a peer's HTTP API. A host may carry an explicit port.
pub fn peer_base_url(host: &str) -> String {
    format!("http://{}", normalize_host(host))
}

/// URL for a peer's status stream.
pub fn peer_ws_url(host: &str) -> String {
    format!("ws://{}/ws", normalize_host(host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_trailing_dot() {
        assert_eq!(normalize_host("OpenEVSE-7856.Local."), "openevse-7856.local");
        assert_eq!(normalize_host("  192.168.1.40 "), "192.168.1.40");
    }

    #[test]
    fn host_validation() {
        assert!(valid_host("openevse-7856.local"));
        assert!(valid_host("192.168.1.40"));
        assert!(valid_host("192.168.1.40:8000"));
        assert!(!valid_host("garage"));
        assert!(!valid_host(""));
        assert!(!valid_host("   "));
    }
}
