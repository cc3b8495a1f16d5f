use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Server/local clock offset tracker.
///
/// Every inbound message that carries a server timestamp feeds `sync`, so
/// the offset is refined opportunistically over the session rather than only
/// at connect time. All countdown math must go through `now_ms`, never raw
/// event-arrival wall-clock time, so network jitter does not distort the
/// displayed countdown.
#[derive(Debug, Default)]
pub struct ClockSync {
    has_offset: AtomicBool,
    offset_ms: AtomicI64,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `offset = server_timestamp - local_now`.
    pub fn sync(&self, server_timestamp_ms: i64) {
        self.sync_at(server_timestamp_ms, local_unix_ms());
    }

    fn sync_at(&self, server_timestamp_ms: i64, local_now_ms: i64) {
        let offset = signed_delta_ms(server_timestamp_ms, local_now_ms);
        self.offset_ms.store(offset, Ordering::Relaxed);
        self.has_offset.store(true, Ordering::Relaxed);
    }

    /// Server-aligned current time. Falls back to raw local time until the
    /// first server sample arrives.
    pub fn now_ms(&self) -> i64 {
        self.now_at(local_unix_ms())
    }

    fn now_at(&self, local_now_ms: i64) -> i64 {
        local_now_ms.saturating_add(self.offset_ms())
    }

    pub fn offset_ms(&self) -> i64 {
        if self.has_offset.load(Ordering::Relaxed) {
            self.offset_ms.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    pub fn has_sample(&self) -> bool {
        self.has_offset.load(Ordering::Relaxed)
    }
}

pub fn local_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

pub fn signed_delta_ms(lhs_ms: i64, rhs_ms: i64) -> i64 {
    let delta = (lhs_ms as i128) - (rhs_ms as i128);
    delta.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsynced_clock_passes_local_time_through() {
        let clock = ClockSync::new();
        assert!(!clock.has_sample());
        assert_eq!(clock.now_at(1_000), 1_000);
    }

    #[test]
    fn first_sample_sets_offset() {
        let clock = ClockSync::new();
        clock.sync_at(1_050, 1_000);
        assert_eq!(clock.offset_ms(), 50);
        assert!(clock.now_at(1_000) >= 1_050);
    }

    #[test]
    fn later_sample_tracks_new_server_time_instead_of_first() {
        let clock = ClockSync::new();
        clock.sync_at(1_050, 1_000);
        clock.sync_at(2_000, 1_940);
        assert_eq!(clock.offset_ms(), 60);
        assert_eq!(clock.now_at(1_940), 2_000);
    }

    #[test]
    fn negative_offset_when_server_lags_local() {
        let clock = ClockSync::new();
        clock.sync_at(900, 1_000);
        assert_eq!(clock.offset_ms(), -100);
        assert_eq!(clock.now_at(1_100), 1_000);
    }

    #[test]
    fn computes_signed_delta_without_overflow() {
        assert_eq!(signed_delta_ms(1_000, 900), 100);
        assert_eq!(signed_delta_ms(900, 1_000), -100);
        assert_eq!(signed_delta_ms(i64::MAX, i64::MIN), i64::MAX);
    }
}
