use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// Hex characters kept from the digest.
pub const FINGERPRINT_LEN: usize = 32;

/// Correlation key for "probably the same client": a truncated SHA-256 over source IP and
/// user-agent. One-way, so the key itself carries no readable client data.
pub fn fingerprint(ip: IpAddr, user_agent: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.unwrap_or_default().as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_bounded() {
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let a = fingerprint(ip, Some("Mozilla/5.0"));
        assert_eq!(a, fingerprint(ip, Some("Mozilla/5.0")));
        assert_eq!(a.len(), FINGERPRINT_LEN);
    }

    #[test]
    fn user_agent_and_ip_both_matter() {
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let other: IpAddr = "203.0.113.10".parse().unwrap();
        let base = fingerprint(ip, Some("Mozilla/5.0"));
        assert_ne!(base, fingerprint(ip, Some("Mozilla/5.1")));
        assert_ne!(base, fingerprint(other, Some("Mozilla/5.0")));
        assert_ne!(base, fingerprint(ip, None));
    }
}
