// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-node I/O throttling limits and limiter state.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of one accounting slice.
pub const SLICE_TIME: Duration = Duration::from_millis(100);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThrottleError {
    #[error(
        "bps(iops) and bps_rd/bps_wr(iops_rd/iops_wr) \
         cannot be used at the same time"
    )]
    TotalAndDirectional,

    #[error("bps and iops values must be 0 or greater")]
    Negative,
}

/// Bytes-per-second and operations-per-second limits.  Zero means
/// unlimited.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(default)]
pub struct IoLimits {
    pub bps: i64,
    pub bps_rd: i64,
    pub bps_wr: i64,
    pub iops: i64,
    pub iops_rd: i64,
    pub iops_wr: i64,
}

impl IoLimits {
    pub fn check(&self) -> Result<(), ThrottleError> {
        let conflicts = |total: i64, rd: i64, wr: i64| {
            total != 0 && (rd != 0 || wr != 0)
        };
        if conflicts(self.bps, self.bps_rd, self.bps_wr)
            || conflicts(self.iops, self.iops_rd, self.iops_wr)
        {
            return Err(ThrottleError::TotalAndDirectional);
        }
        if self.values().iter().any(|v| *v < 0) {
            return Err(ThrottleError::Negative);
        }
        Ok(())
    }

    /// Whether any limit is in force.
    pub fn is_enabled(&self) -> bool {
        self.values().iter().any(|v| *v != 0)
    }

    fn values(&self) -> [i64; 6] {
        [
            self.bps,
            self.bps_rd,
            self.bps_wr,
            self.iops,
            self.iops_rd,
            self.iops_wr,
        ]
    }

    fn bps_for(&self, is_write: bool) -> u64 {
        match (self.bps, is_write) {
            (0, false) => self.bps_rd as u64,
            (0, true) => self.bps_wr as u64,
            (total, _) => total as u64,
        }
    }

    fn iops_for(&self, is_write: bool) -> u64 {
        match (self.iops, is_write) {
            (0, false) => self.iops_rd as u64,
            (0, true) => self.iops_wr as u64,
            (total, _) => total as u64,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Dispatched {
    bytes: [u64; 2],
    ops: [u64; 2],
}

/// Limiter state attached to a node.
#[derive(Debug, Default)]
pub struct Throttle {
    limits: IoLimits,
    enabled: bool,
    /// The limiter timer.  Present while the limiter is enabled; carries a
    /// deadline while armed.
    timer: Option<Option<Instant>>,
    slice_start: Option<Instant>,
    dispatched: Dispatched,
}

impl Throttle {
    pub fn limits(&self) -> &IoLimits {
        &self.limits
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub fn timer_deadline(&self) -> Option<Instant> {
        self.timer.flatten()
    }

    pub(crate) fn set_limits(&mut self, limits: IoLimits) {
        self.limits = limits;
    }

    pub(crate) fn enable(&mut self) {
        self.enabled = true;
        self.timer = Some(None);
        self.slice_start = None;
        self.dispatched = Dispatched::default();
    }

    pub(crate) fn disable(&mut self) {
        self.enabled = false;
        self.timer = None;
        self.slice_start = None;
    }

    /// Re-arm the limiter timer so it fires at `when`, if there is a timer.
    pub(crate) fn rearm(&mut self, when: Instant) -> bool {
        match &mut self.timer {
            Some(deadline) => {
                *deadline = Some(when);
                true
            }
            None => false,
        }
    }

    /// Fire the timer if it is due.  A fired timer starts a fresh slice.
    pub(crate) fn fire_if_due(&mut self, now: Instant) -> bool {
        if !matches!(self.timer, Some(Some(deadline)) if deadline <= now) {
            return false;
        }
        self.timer = Some(None);
        self.slice_start = Some(now);
        self.dispatched = Dispatched::default();
        true
    }

    /// Account a request against the current slice.  Returns how long the
    /// request would have to wait when it exceeds the configured budget, in
    /// which case the timer is armed for the end of the slice.
    pub(crate) fn account(
        &mut self,
        is_write: bool,
        bytes: u64,
        now: Instant,
    ) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        let start = match self.slice_start {
            Some(start) if now < start + SLICE_TIME => start,
            _ => {
                self.dispatched = Dispatched::default();
                self.slice_start = Some(now);
                now
            }
        };

        let dir = is_write as usize;
        let slice_ms = SLICE_TIME.as_millis() as u64;
        let over = |limit: u64, done: u64, want: u64| {
            limit != 0
                && done.saturating_add(want)
                    > limit.saturating_mul(slice_ms) / 1000
        };
        let total_bytes = self.dispatched.bytes[0] + self.dispatched.bytes[1];
        let total_ops = self.dispatched.ops[0] + self.dispatched.ops[1];
        let (bytes_done, ops_done) = match (self.limits.bps, self.limits.iops) {
            (0, 0) => (self.dispatched.bytes[dir], self.dispatched.ops[dir]),
            (0, _) => (self.dispatched.bytes[dir], total_ops),
            (_, 0) => (total_bytes, self.dispatched.ops[dir]),
            _ => (total_bytes, total_ops),
        };

        self.dispatched.bytes[dir] += bytes;
        self.dispatched.ops[dir] += 1;
        if over(self.limits.bps_for(is_write), bytes_done, bytes)
            || over(self.limits.iops_for(is_write), ops_done, 1)
        {
            let end = start + SLICE_TIME;
            self.rearm(end);
            return Some(end - now);
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn total_excludes_directional() {
        let limits = IoLimits { bps: 100, bps_rd: 50, ..Default::default() };
        assert_eq!(limits.check(), Err(ThrottleError::TotalAndDirectional));

        let limits = IoLimits { iops: 100, iops_wr: 5, ..Default::default() };
        assert_eq!(limits.check(), Err(ThrottleError::TotalAndDirectional));

        let limits = IoLimits { bps_rd: 50, ..Default::default() };
        assert_eq!(limits.check(), Ok(()));

        let limits =
            IoLimits { bps_rd: 50, bps_wr: 60, iops: 7, ..Default::default() };
        assert_eq!(limits.check(), Ok(()));
    }

    #[test]
    fn negative_rejected() {
        let limits = IoLimits { iops_rd: -1, ..Default::default() };
        assert_eq!(limits.check(), Err(ThrottleError::Negative));
    }

    #[test]
    fn enabled_when_any_nonzero() {
        assert!(!IoLimits::default().is_enabled());
        assert!(IoLimits { iops_wr: 1, ..Default::default() }.is_enabled());
    }

    #[test]
    fn account_arms_timer_when_over_budget() {
        let mut thr = Throttle::default();
        thr.set_limits(IoLimits { bps_wr: 10_000, ..Default::default() });
        thr.enable();
        assert!(thr.has_timer());
        assert_eq!(thr.timer_deadline(), None);

        // 1000 bytes per 100ms slice.
        let now = Instant::now();
        assert_eq!(thr.account(true, 600, now), None);
        assert!(thr.account(true, 600, now).is_some());
        assert!(thr.timer_deadline().is_some());
        // Reads are not limited.
        assert_eq!(thr.account(false, 1 << 20, now), None);

        assert!(thr.fire_if_due(now + SLICE_TIME));
        assert_eq!(thr.timer_deadline(), None);
    }

    #[test]
    fn largest_limits_never_wait() {
        let mut thr = Throttle::default();
        let limits =
            IoLimits { bps: i64::MAX, iops: i64::MAX, ..Default::default() };
        assert_eq!(limits.check(), Ok(()));
        thr.set_limits(limits);
        thr.enable();
        let now = Instant::now();
        assert_eq!(thr.account(true, 1, now), None);
        assert_eq!(thr.account(false, 1 << 30, now), None);
        assert_eq!(thr.timer_deadline(), None);
    }

    #[test]
    fn disabled_throttle_never_waits() {
        let mut thr = Throttle::default();
        thr.set_limits(IoLimits { bps: 1, ..Default::default() });
        assert_eq!(thr.account(true, 1 << 20, Instant::now()), None);
        assert!(!thr.rearm(Instant::now()));
    }
}
