//! RTT / clock-offset estimation from the three-timestamp exchange.
//!
//! Each `TimeSync{t0, t1, t2}` message carries: `t0` = our send time of the
//! previous exchange (our clock), `t1` = the peer's receive time of it,
//! `t2` = the peer's send time of this message (both peer clock). Stamping
//! the arrival as `t3` completes the quadruple:
//!
//! ```text
//! rtt    = (t3 - t0) - (t2 - t1)
//! offset = ((t1 - t0) + (t2 - t3)) / 2
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncResult {
    /// Round-trip time in microseconds.
    pub rtt: i64,
    /// Estimated peer-clock minus local-clock, microseconds.
    pub time_diff: i64,
}

/// Stores the half-exchange needed to stamp the next outgoing message.
#[derive(Debug, Default)]
pub struct TimeSync {
    /// Peer's send time from their last message (their clock). Echoed back
    /// as the next outgoing `t0`.
    t0: i64,
    /// Our receive time of that message. Echoed back as the next `t1`.
    t1: i64,
}

impl TimeSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a received exchange; `t3` is the local arrival time. Returns a
    /// result only once the quadruple is complete (the first message of a
    /// conversation carries zeros).
    pub fn calc(&mut self, t0: i64, t1: i64, t2: i64, t3: i64) -> Option<TimeSyncResult> {
        let result = if t0 != 0 && t1 != 0 {
            Some(TimeSyncResult {
                rtt: (t3 - t0) - (t2 - t1),
                time_diff: ((t1 - t0) + (t2 - t3)) / 2,
            })
        } else {
            None
        };
        self.t0 = t2;
        self.t1 = t3;
        result
    }

    /// `t0` for the next outgoing message.
    pub fn t0(&self) -> i64 {
        self.t0
    }

    /// `t1` for the next outgoing message.
    pub fn t1(&self) -> i64 {
        self.t1
    }
}
