//! Hybrid logical clock
//!
//! Timestamps order by physical milliseconds, then a logical counter, then the
//! issuing client's id. They never go backward on one client, and no two
//! clients ever issue the same timestamp.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of physical time in Unix milliseconds
pub trait ClockSource: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock whose time is set by hand, for tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(millis: i64) -> Self {
        Self(AtomicI64::new(millis))
    }

    pub fn set(&self, millis: i64) {
        self.0.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// HLC timestamp; field order is the total order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub millis: i64,
    pub counter: u32,
    pub node: String,
}

impl Timestamp {
    pub fn new(millis: i64, counter: u32, node: impl Into<String>) -> Self {
        Self {
            millis,
            counter,
            node: node.into(),
        }
    }

    /// Smallest timestamp, ordered before anything a clock issues
    pub fn zero() -> Self {
        Self::new(0, 0, "")
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:013}-{:04x}-{}", self.millis, self.counter, self.node)
    }
}

/// Per-client hybrid logical clock
pub struct Hlc {
    node: String,
    last_millis: i64,
    counter: u32,
    source: Arc<dyn ClockSource>,
}

impl std::fmt::Debug for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hlc")
            .field("node", &self.node)
            .field("last_millis", &self.last_millis)
            .field("counter", &self.counter)
            .finish()
    }
}

impl Hlc {
    /// Clock for `node` reading the wall clock
    pub fn new(node: impl Into<String>) -> Self {
        Self::with_source(node, Arc::new(SystemClock))
    }

    pub fn with_source(node: impl Into<String>, source: Arc<dyn ClockSource>) -> Self {
        Self {
            node: node.into(),
            last_millis: 0,
            counter: 0,
            source,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Last issued or observed timestamp
    pub fn last(&self) -> Timestamp {
        Timestamp::new(self.last_millis, self.counter, self.node.clone())
    }

    /// Issue a timestamp strictly after every one issued or observed so far
    pub fn next(&mut self) -> Timestamp {
        let now = self.source.now_millis();
        if now > self.last_millis {
            self.last_millis = now;
            self.counter = 0;
        } else {
            self.bump();
        }
        self.last()
    }

    /// Advance past a timestamp seen from another client
    pub fn recv(&mut self, remote: &Timestamp) {
        let now = self.source.now_millis();
        let millis = now.max(self.last_millis).max(remote.millis);
        if millis == self.last_millis && millis == remote.millis {
            self.counter = self.counter.max(remote.counter);
            self.bump();
        } else if millis == self.last_millis {
            self.bump();
        } else if millis == remote.millis {
            self.last_millis = millis;
            self.counter = remote.counter;
            self.bump();
        } else {
            self.last_millis = millis;
            self.counter = 0;
        }
    }

    fn bump(&mut self) {
        match self.counter.checked_add(1) {
            Some(c) => self.counter = c,
            None => {
                // Counter exhausted within one millisecond; borrow from the future
                self.last_millis += 1;
                self.counter = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manual(node: &str, at: i64) -> (Arc<ManualClock>, Hlc) {
        let clock = Arc::new(ManualClock::new(at));
        let hlc = Hlc::with_source(node, clock.clone());
        (clock, hlc)
    }

    #[test]
    fn test_next_is_monotonic_when_clock_stalls() {
        let (_clock, mut hlc) = manual("a", 1000);
        let t1 = hlc.next();
        let t2 = hlc.next();
        assert!(t2 > t1);
        assert_eq!(t2.millis, 1000);
        assert_eq!(t2.counter, 1);
    }

    #[test]
    fn test_next_survives_clock_going_backward() {
        let (clock, mut hlc) = manual("a", 5000);
        let t1 = hlc.next();
        clock.set(1000);
        let t2 = hlc.next();
        assert!(t2 > t1);
        assert_eq!(t2.millis, 5000);
    }

    #[test]
    fn test_recv_moves_past_remote() {
        let (_clock, mut hlc) = manual("a", 1000);
        hlc.next();
        let remote = Timestamp::new(9000, 7, "b");
        hlc.recv(&remote);
        let t = hlc.next();
        assert!(t > remote);
        assert_eq!(t.millis, 9000);
    }

    #[test]
    fn test_node_breaks_ties() {
        let (_ca, mut a) = manual("a", 1000);
        let (_cb, mut b) = manual("b", 1000);
        let ta = a.next();
        let tb = b.next();
        assert_ne!(ta, tb);
        assert!(tb > ta);
    }

    #[test]
    fn test_display_sorts_like_timestamp() {
        let t1 = Timestamp::new(99, 0, "a");
        let t2 = Timestamp::new(100, 0, "a");
        assert!(t1.to_string() < t2.to_string());
    }

    proptest! {
        #[test]
        fn prop_timestamps_strictly_increase(steps in prop::collection::vec((-50i64..50, any::<bool>(), 0i64..10_000, 0u32..5), 1..60)) {
            let (clock, mut hlc) = manual("n", 10_000);
            let mut last = hlc.last();
            for (delta, observe, remote_ms, remote_ctr) in steps {
                clock.advance(delta);
                if observe {
                    let remote = Timestamp::new(remote_ms, remote_ctr, "r");
                    hlc.recv(&remote);
                    let t = hlc.next();
                    prop_assert!(t > remote);
                    prop_assert!(t > last);
                    last = t;
                } else {
                    let t = hlc.next();
                    prop_assert!(t > last);
                    last = t;
                }
            }
        }
    }
}
