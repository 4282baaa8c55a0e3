use std::time::Duration;

/// Capped exponential backoff. Attempt numbering starts at zero,
/// so `delay(0) == base`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

/// Backoff used while a remote create/poll/destroy call keeps failing
/// transiently (network, quota, rate limits).
pub const REMOTE_CALL_BACKOFF: Backoff = Backoff {
    base: Duration::from_secs(2),
    cap: Duration::from_secs(5 * 60),
};

/// Backoff used by the tunnel bridge when the remote endpoint is unreachable.
pub const TUNNEL_RECONNECT_BACKOFF: Backoff = Backoff {
    base: Duration::from_secs(1),
    cap: Duration::from_secs(30),
};

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32);
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent));

        delay.min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::REMOTE_CALL_BACKOFF;

    #[test]
    fn remote_call_backoff_doubles_and_caps() {
        assert_eq!(REMOTE_CALL_BACKOFF.delay(0), Duration::from_secs(2));
        assert_eq!(REMOTE_CALL_BACKOFF.delay(1), Duration::from_secs(4));
        assert_eq!(REMOTE_CALL_BACKOFF.delay(2), Duration::from_secs(8));
        assert_eq!(REMOTE_CALL_BACKOFF.delay(10), Duration::from_secs(300));
        assert_eq!(REMOTE_CALL_BACKOFF.delay(u32::MAX), Duration::from_secs(300));
    }
}
