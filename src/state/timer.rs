//! Anchor-based session timer.
//!
//! The remaining (or elapsed) time is never stored as a decrementing counter. It is derived
//! from `now - anchor` whenever someone asks, so no server-side ticking loop exists.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use utoipa::ToSchema;

use crate::error::ServiceError;

/// Largest duration or single adjustment a timer accepts, in seconds.
pub const MAX_TIMER_SECONDS: i64 = 86_400;

/// Whether the timer counts down to zero or up from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimerDirection {
    /// Remaining time shrinks towards zero.
    #[default]
    Countdown,
    /// Elapsed time grows from zero.
    CountUp,
}

impl TimerDirection {
    /// Sign applied to elapsed wall-clock time.
    pub fn sign(self) -> i64 {
        match self {
            TimerDirection::Countdown => -1,
            TimerDirection::CountUp => 1,
        }
    }
}

/// Run state of the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    /// Never started or reset.
    #[default]
    Idle,
    /// Anchored and moving.
    Running,
    /// Frozen; `duration_seconds` holds the captured value.
    Paused,
    /// Countdown reached zero.
    Finished,
}

impl fmt::Display for TimerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerStatus::Idle => "idle",
            TimerStatus::Running => "running",
            TimerStatus::Paused => "paused",
            TimerStatus::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Timer operation rejected in the current status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {operation} a timer that is {status}")]
pub struct TimerError {
    /// Current status.
    pub status: TimerStatus,
    /// Rejected operation name.
    pub operation: &'static str,
}

impl From<TimerError> for ServiceError {
    fn from(err: TimerError) -> Self {
        ServiceError::invalid_transition(err.to_string(), err.status)
    }
}

/// Persisted timer state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
pub struct TimerState {
    /// Wall-clock instant the current run started from; `None` unless running.
    #[serde(with = "time::serde::rfc3339::option", default)]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub anchor: Option<OffsetDateTime>,
    /// Counting direction.
    pub direction: TimerDirection,
    /// Value at the anchor: remaining seconds for a countdown, elapsed for count-up.
    pub duration_seconds: i64,
    /// Run state.
    pub status: TimerStatus,
    /// Bumped on every change so stale expiry tasks can tell they are outdated.
    #[serde(default)]
    pub generation: u64,
}

impl TimerState {
    /// Current displayed value in whole seconds, computed from the anchor.
    pub fn value_at(&self, now: OffsetDateTime) -> i64 {
        match (self.status, self.anchor) {
            (TimerStatus::Running, Some(anchor)) => {
                let elapsed = (now - anchor).whole_seconds().max(0);
                let value = self
                    .duration_seconds
                    .saturating_add(self.direction.sign() * elapsed);
                match self.direction {
                    TimerDirection::Countdown => value.max(0),
                    TimerDirection::CountUp => value,
                }
            }
            _ => self.duration_seconds,
        }
    }

    /// Instant a running countdown reaches zero; `None` past the representable range.
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        match (self.status, self.direction, self.anchor) {
            (TimerStatus::Running, TimerDirection::Countdown, Some(anchor)) => {
                anchor.checked_add(Duration::seconds(self.duration_seconds))
            }
            _ => None,
        }
    }

    /// Start a fresh run, replacing any previous one.
    pub fn start(
        &mut self,
        duration_seconds: i64,
        direction: TimerDirection,
        now: OffsetDateTime,
    ) -> Result<(), TimerError> {
        if duration_seconds < 0
            || (direction == TimerDirection::Countdown && duration_seconds == 0)
        {
            return Err(TimerError {
                status: self.status,
                operation: "start with a non-positive duration",
            });
        }
        if duration_seconds > MAX_TIMER_SECONDS {
            return Err(TimerError {
                status: self.status,
                operation: "start with a duration above 24 hours",
            });
        }
        self.anchor = Some(now);
        self.direction = direction;
        self.duration_seconds = duration_seconds;
        self.status = TimerStatus::Running;
        self.generation += 1;
        Ok(())
    }

    /// Freeze the computed value and clear the anchor.
    pub fn pause(&mut self, now: OffsetDateTime) -> Result<(), TimerError> {
        if self.status != TimerStatus::Running {
            return Err(TimerError {
                status: self.status,
                operation: "pause",
            });
        }
        self.duration_seconds = self.value_at(now);
        self.anchor = None;
        self.status = TimerStatus::Paused;
        self.generation += 1;
        Ok(())
    }

    /// Re-anchor a paused timer at `now`.
    pub fn resume(&mut self, now: OffsetDateTime) -> Result<(), TimerError> {
        if self.status != TimerStatus::Paused {
            return Err(TimerError {
                status: self.status,
                operation: "resume",
            });
        }
        self.anchor = Some(now);
        self.status = TimerStatus::Running;
        self.generation += 1;
        Ok(())
    }

    /// Return to idle.
    pub fn reset(&mut self) {
        self.anchor = None;
        self.duration_seconds = 0;
        self.status = TimerStatus::Idle;
        self.generation += 1;
    }

    /// Shift the displayed value by `delta_seconds`, re-anchoring a running timer.
    pub fn adjust(&mut self, delta_seconds: i64, now: OffsetDateTime) -> Result<(), TimerError> {
        if matches!(self.status, TimerStatus::Idle | TimerStatus::Finished) {
            return Err(TimerError {
                status: self.status,
                operation: "adjust",
            });
        }
        if !(-MAX_TIMER_SECONDS..=MAX_TIMER_SECONDS).contains(&delta_seconds) {
            return Err(TimerError {
                status: self.status,
                operation: "adjust by more than 24 hours",
            });
        }
        let value = self.value_at(now).saturating_add(delta_seconds).max(0);
        self.duration_seconds = value;
        if self.status == TimerStatus::Running {
            self.anchor = Some(now);
        }
        self.generation += 1;
        Ok(())
    }

    /// Mark a running countdown finished if it has reached zero at `now`.
    pub fn finish_if_expired(&mut self, now: OffsetDateTime) -> bool {
        let expired = self.expires_at().is_some_and(|at| at <= now);
        if expired {
            self.anchor = None;
            self.duration_seconds = 0;
            self.status = TimerStatus::Finished;
            self.generation += 1;
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    #[test]
    fn countdown_is_computed_from_anchor() {
        let mut timer = TimerState::default();
        timer.start(300, TimerDirection::Countdown, t0()).unwrap();
        assert_eq!(timer.value_at(t0() + Duration::seconds(45)), 255);
        assert_eq!(timer.value_at(t0() + Duration::seconds(900)), 0);
        assert_eq!(timer.expires_at(), Some(t0() + Duration::seconds(300)));
    }

    #[test]
    fn pause_captures_value_and_resume_reanchors() {
        let mut timer = TimerState::default();
        timer.start(300, TimerDirection::Countdown, t0()).unwrap();
        timer.pause(t0() + Duration::seconds(100)).unwrap();
        assert_eq!(timer.anchor, None);
        assert_eq!(timer.duration_seconds, 200);
        assert_eq!(timer.value_at(t0() + Duration::seconds(5_000)), 200);

        let resumed_at = t0() + Duration::seconds(1_000);
        timer.resume(resumed_at).unwrap();
        assert_eq!(timer.value_at(resumed_at + Duration::seconds(50)), 150);
    }

    #[test]
    fn count_up_accumulates_across_pauses() {
        let mut timer = TimerState::default();
        timer.start(0, TimerDirection::CountUp, t0()).unwrap();
        timer.pause(t0() + Duration::seconds(30)).unwrap();
        timer.resume(t0() + Duration::seconds(60)).unwrap();
        assert_eq!(timer.value_at(t0() + Duration::seconds(70)), 40);
        assert_eq!(timer.expires_at(), None);
    }

    #[test]
    fn adjust_shifts_running_countdown() {
        let mut timer = TimerState::default();
        timer.start(60, TimerDirection::Countdown, t0()).unwrap();
        let now = t0() + Duration::seconds(20);
        timer.adjust(30, now).unwrap();
        assert_eq!(timer.value_at(now), 70);
        timer.adjust(-500, now).unwrap();
        assert_eq!(timer.value_at(now), 0);
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let mut timer = TimerState::default();
        assert!(timer.start(i64::MAX, TimerDirection::Countdown, t0()).is_err());
        assert!(
            timer
                .start(MAX_TIMER_SECONDS + 1, TimerDirection::Countdown, t0())
                .is_err()
        );
        assert_eq!(timer.status, TimerStatus::Idle);

        timer.start(MAX_TIMER_SECONDS, TimerDirection::Countdown, t0()).unwrap();
        assert!(timer.adjust(i64::MAX, t0()).is_err());
        assert!(timer.adjust(i64::MIN, t0()).is_err());
        assert_eq!(timer.value_at(t0()), MAX_TIMER_SECONDS);
        assert_eq!(
            timer.expires_at(),
            Some(t0() + Duration::seconds(MAX_TIMER_SECONDS))
        );
    }

    #[test]
    fn expiry_past_the_calendar_is_none() {
        let timer = TimerState {
            anchor: Some(t0()),
            direction: TimerDirection::Countdown,
            duration_seconds: i64::MAX,
            status: TimerStatus::Running,
            generation: 1,
        };
        assert_eq!(timer.expires_at(), None);
    }

    #[test]
    fn finish_only_when_expired() {
        let mut timer = TimerState::default();
        timer.start(10, TimerDirection::Countdown, t0()).unwrap();
        assert!(!timer.finish_if_expired(t0() + Duration::seconds(9)));
        assert!(timer.finish_if_expired(t0() + Duration::seconds(10)));
        assert_eq!(timer.status, TimerStatus::Finished);
        assert!(timer.pause(t0()).is_err());
    }

    #[test]
    fn every_change_bumps_generation() {
        let mut timer = TimerState::default();
        timer.start(10, TimerDirection::Countdown, t0()).unwrap();
        let first = timer.generation;
        timer.pause(t0()).unwrap();
        assert!(timer.generation > first);
        assert!(timer.start(0, TimerDirection::Countdown, t0()).is_err());
    }
}
