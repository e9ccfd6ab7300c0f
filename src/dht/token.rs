use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;

use crate::caps::Entropy;

/// Secret rotation period
pub const ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Announce tokens per BEP 5: a token proves the announcing node owns
/// the address that asked `get_peers` recently. The secret rotates every
/// five minutes and one previous secret stays valid, so tokens are
/// accepted for up to ten minutes.
#[derive(Debug)]
pub struct TokenStore {
    current: [u8; 32],
    previous: [u8; 32],
    last_rotated: Duration,
}

impl TokenStore {
    pub fn new(entropy: &dyn Entropy, now: Duration) -> Self {
        let mut current = [0u8; 32];
        let mut previous = [0u8; 32];
        // a placeholder previous secret would let strangers announce to a
        // freshly started node, so both start random
        entropy.fill(&mut current);
        entropy.fill(&mut previous);
        Self {
            current,
            previous,
            last_rotated: now,
        }
    }

    /// Rotate when the period elapsed. Driven by the maintenance sweep.
    pub fn maybe_rotate(&mut self, now: Duration, entropy: &dyn Entropy) {
        while now.saturating_sub(self.last_rotated) >= ROTATE_INTERVAL {
            self.previous = self.current;
            entropy.fill(&mut self.current);
            self.last_rotated += ROTATE_INTERVAL;
        }
    }

    fn token_for(secret: &[u8; 32], addr: &SocketAddr) -> [u8; 20] {
        let mut keyed = secret.to_vec();
        match addr.ip() {
            std::net::IpAddr::V4(ip) => keyed.extend_from_slice(&ip.octets()),
            std::net::IpAddr::V6(ip) => keyed.extend_from_slice(&ip.octets()),
        }
        crate::utils::sha1(&keyed)
    }

    /// Token handed out with `get_peers` responses
    pub fn generate(&self, addr: &SocketAddr) -> Bytes {
        Bytes::copy_from_slice(&Self::token_for(&self.current, addr))
    }

    /// Accepts tokens minted with the current or the previous secret
    pub fn validate(&self, addr: &SocketAddr, token: &[u8]) -> bool {
        token == Self::token_for(&self.current, addr)
            || token == Self::token_for(&self.previous, addr)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::caps::memory::SeededEntropy;

    use super::TokenStore;

    const MIN: Duration = Duration::from_secs(60);

    #[test]
    fn token_validity_window() {
        let entropy = SeededEntropy::new(4);
        let addr = "1.2.3.4:6881".parse().unwrap();
        let mut store = TokenStore::new(&entropy, Duration::ZERO);

        // token issued at t=0
        let token = store.generate(&addr);
        assert!(store.validate(&addr, &token));

        // rotation at t=5min keeps the minting secret as previous
        store.maybe_rotate(5 * MIN, &entropy);
        assert!(store.validate(&addr, &token));
        // still fine at t=9min, no rotation due yet
        store.maybe_rotate(9 * MIN, &entropy);
        assert!(store.validate(&addr, &token));

        // second rotation at t=10min drops the original secret
        store.maybe_rotate(11 * MIN, &entropy);
        assert!(!store.validate(&addr, &token));
    }

    #[test]
    fn tokens_are_bound_to_the_address() {
        let entropy = SeededEntropy::new(4);
        let store = TokenStore::new(&entropy, Duration::ZERO);
        let addr_a = "1.2.3.4:6881".parse().unwrap();
        let addr_b = "4.3.2.1:6881".parse().unwrap();
        let token = store.generate(&addr_a);
        assert!(store.validate(&addr_a, &token));
        assert!(!store.validate(&addr_b, &token));
        // tokens ignore the port, only the address matters
        let addr_a_other_port = "1.2.3.4:9999".parse().unwrap();
        assert!(store.validate(&addr_a_other_port, &token));
    }

    #[test]
    fn missed_rotations_catch_up() {
        let entropy = SeededEntropy::new(4);
        let addr = "1.2.3.4:6881".parse().unwrap();
        let mut store = TokenStore::new(&entropy, Duration::ZERO);
        let token = store.generate(&addr);
        // a long gap covers several periods at once
        store.maybe_rotate(25 * MIN, &entropy);
        assert!(!store.validate(&addr, &token));
    }
}
