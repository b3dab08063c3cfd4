//! Per-worker counters.

use std::fmt;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct WorkerStats {
    pub accepts: AtomicU64,
    pub rejected: AtomicU64,
    pub receives: AtomicU64,
    pub sends: AtomicU64,
    pub disconnects: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub errors: AtomicU64,
    /// Completions that arrived for a slot in a state expecting none.
    pub protocol_violations: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            accepts: get(&self.accepts),
            rejected: get(&self.rejected),
            receives: get(&self.receives),
            sends: get(&self.sends),
            disconnects: get(&self.disconnects),
            bytes_in: get(&self.bytes_in),
            bytes_out: get(&self.bytes_out),
            errors: get(&self.errors),
            protocol_violations: get(&self.protocol_violations),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepts: u64,
    pub rejected: u64,
    pub receives: u64,
    pub sends: u64,
    pub disconnects: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors: u64,
    pub protocol_violations: u64,
}

impl StatsSnapshot {
    /// Connections accepted but not yet torn down.
    pub fn open(&self) -> u64 {
        self.accepts.saturating_sub(self.disconnects)
    }
}

impl AddAssign for StatsSnapshot {
    fn add_assign(&mut self, o: Self) {
        self.accepts += o.accepts;
        self.rejected += o.rejected;
        self.receives += o.receives;
        self.sends += o.sends;
        self.disconnects += o.disconnects;
        self.bytes_in += o.bytes_in;
        self.bytes_out += o.bytes_out;
        self.errors += o.errors;
        self.protocol_violations += o.protocol_violations;
    }
}

impl std::iter::Sum for StatsSnapshot {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        let mut total = StatsSnapshot::default();
        for s in iter {
            total += s;
        }
        total
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "open={} accepts={} rejected={} recv={} send={} close={} bytes_in={} bytes_out={} err={} violations={}",
            self.open(),
            self.accepts,
            self.rejected,
            self.receives,
            self.sends,
            self.disconnects,
            self.bytes_in,
            self.bytes_out,
            self.errors,
            self.protocol_violations,
        )
    }
}
