//! Tick ordering.
//!
//! Envelope ticks are a wrapping `u32`. A tick lower than the last one seen is
//! stale, except right at the wrap point: when the last tick sits within
//! `wrap_window` of `u32::MAX` and the new one within `wrap_window` of zero,
//! the counter has wrapped and the new tick is the latest. A tick more than
//! half the range above the last one is a straggler from before a wrap, and
//! stale even though it compares higher.

/// Last-seen tick tracker.
#[derive(Debug, Clone)]
pub struct TickFilter {
    last_seen: Option<u32>,
    wrap_window: u32,
}

impl TickFilter {
    pub fn new(wrap_window: u32) -> Self {
        Self {
            last_seen: None,
            wrap_window,
        }
    }

    pub fn last_seen(&self) -> Option<u32> {
        self.last_seen
    }

    /// Whether `tick` is not older than the last accepted tick.
    pub fn is_fresh(&self, tick: u32) -> bool {
        match self.last_seen {
            None => true,
            Some(last) if tick >= last => tick - last <= u32::MAX / 2,
            Some(last) => last >= u32::MAX - self.wrap_window && tick <= self.wrap_window,
        }
    }

    /// Checks `tick` and, when fresh, records it. Returns freshness.
    pub fn observe(&mut self, tick: u32) -> bool {
        let fresh = self.is_fresh(tick);
        if fresh {
            self.last_seen = Some(tick);
        }
        fresh
    }
}
