//! Periodic publication timer.
//!
//! Ticks land on a wall-clock grid anchored at a configured reference
//! time-of-day: the next tick is the end of the current interval bin plus
//! one interval. One fetch-and-publish cycle runs per tick, on this task;
//! if a cycle is still running when the timer fires, the tick is dropped.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use psych_metadata::Knobs;

use crate::fetch::FetchFlags;
use crate::runner::Runner;

/// Compute the next aligned tick strictly after `now`.
///
/// The reference instant is today (or an earlier day) at `reference`,
/// pushed back until `reference + interval <= now`; the tick is then the
/// next interval boundary on the grid it anchors.
pub fn next_tick(now: DateTime<Utc>, reference: NaiveTime, interval_secs: u64) -> DateTime<Utc> {
    let interval = ChronoDuration::seconds(interval_secs as i64);
    let mut reference_time = now
        .date_naive()
        .and_time(reference)
        .and_utc();
    while reference_time + interval > now {
        reference_time -= ChronoDuration::days(1);
    }

    let offset = (now - reference_time).num_seconds();
    let end = reference_time + ChronoDuration::seconds((offset / interval_secs as i64) * interval_secs as i64);
    end + interval
}

pub struct Scheduler {
    interval_secs: u64,
    reference: NaiveTime,
    tolerable_delay_ms: u64,
}

impl Scheduler {
    pub fn new(knobs: &Knobs) -> Self {
        Self {
            interval_secs: knobs.interval_secs,
            reference: knobs.time_offset_constant,
            tolerable_delay_ms: knobs.tolerable_delay_ms,
        }
    }

    /// Sleep-fire loop until shutdown. Cycles run to completion on this
    /// task; a shutdown signal wakes the sleeper but lets an in-progress
    /// cycle finish.
    pub async fn run(&self, runner: &Runner, mut shutdown: watch::Receiver<bool>) {
        let interval = ChronoDuration::seconds(self.interval_secs as i64);
        let mut next = next_tick(Utc::now(), self.reference, self.interval_secs);
        info!(
            interval_secs = self.interval_secs,
            offset = %self.reference,
            due = %next,
            "added periodic timer"
        );

        loop {
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler interrupted");
                        return;
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    let fired = Utc::now();
                    let late_ms = (fired - next).num_milliseconds().max(0) as u64;
                    if late_ms > self.tolerable_delay_ms {
                        warn!(late_ms, "timer fired late");
                    } else {
                        debug!(late_ms, "timer fired");
                    }

                    runner.run_cycle(FetchFlags::periodic()).await;

                    // Exactly one interval per tick; missed boundaries are
                    // drift, never coalesced.
                    next += interval;
                    let now = Utc::now();
                    if now >= next {
                        warn!(
                            behind_ms = (now - next).num_milliseconds(),
                            "cycle overran the interval"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn tod(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_next_tick_on_grid() {
        // Reference 00:01:00, interval 60s: grid is every minute at :00+1m.
        let now = at(2024, 1, 2, 10, 30, 15);
        let next = next_tick(now, tod(0, 1, 0), 60);
        assert_eq!(next, at(2024, 1, 2, 10, 31, 0));
    }

    #[test]
    fn test_next_tick_exactly_on_boundary_advances() {
        let now = at(2024, 1, 2, 10, 30, 0);
        let next = next_tick(now, tod(0, 1, 0), 60);
        assert_eq!(next, at(2024, 1, 2, 10, 31, 0));
    }

    #[test]
    fn test_next_tick_before_reference_uses_prior_day() {
        // 00:00:30, reference 00:01:00: the anchor is yesterday.
        let now = at(2024, 1, 2, 0, 0, 30);
        let next = next_tick(now, tod(0, 1, 0), 60);
        assert_eq!(next, at(2024, 1, 2, 0, 1, 0));
    }

    #[test]
    fn test_next_tick_large_interval() {
        // Hourly grid anchored at 00:30:00.
        let now = at(2024, 1, 2, 14, 45, 0);
        let next = next_tick(now, tod(0, 30, 0), 3600);
        assert_eq!(next, at(2024, 1, 2, 15, 30, 0));
    }

    #[test]
    fn test_alignment_invariant() {
        // (next - R) mod I == 0, next > now, next - now <= I.
        let cases = [
            (at(2024, 1, 2, 10, 30, 15), tod(0, 1, 0), 60u64),
            (at(2024, 1, 2, 0, 0, 1), tod(0, 1, 0), 60),
            (at(2024, 1, 2, 23, 59, 59), tod(0, 0, 0), 300),
            (at(2024, 6, 15, 12, 0, 0), tod(6, 30, 0), 900),
            (at(2024, 6, 15, 3, 13, 37), tod(4, 0, 0), 7200),
            (at(2024, 12, 31, 23, 59, 59), tod(23, 59, 58), 86_400),
        ];
        for (now, reference, interval) in cases {
            let next = next_tick(now, reference, interval);
            assert!(next > now, "next {next} not after now {now}");
            assert!(
                (next - now).num_seconds() <= interval as i64,
                "next {next} more than one interval after now {now}"
            );
            let mut anchor = now.date_naive().and_time(reference).and_utc();
            while anchor > next {
                anchor -= ChronoDuration::days(1);
            }
            assert_eq!(
                (next - anchor).num_seconds() % interval as i64,
                0,
                "next {next} off the grid anchored at {anchor}"
            );
        }
    }
}
