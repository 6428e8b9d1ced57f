use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use thiserror::Error;

/// Tolerance for one-shot timestamps that land marginally in the past between
/// the caller constructing them and the scheduler validating them. Anything
/// older is rejected as [`TriggerError::Past`].
const SCHEDULE_GRACE: TimeDelta = TimeDelta::seconds(1);

/// The rule determining when a job becomes due.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fire once at the given time.
    Once(DateTime<Utc>),
    /// Fire repeatedly at a fixed interval, anchored on the previous fire
    /// time rather than on run completion, so the cadence does not drift.
    Every(TimeDelta),
    /// Fire on a cron schedule (the `cron` crate's seconds-resolution
    /// syntax). Construct via [`Trigger::cron`].
    Cron {
        schedule: Box<Schedule>,
        expression: String,
    },
}

impl Trigger {
    /// Parses a cron expression into a trigger.
    ///
    /// ```
    /// use metronome::trigger::Trigger;
    ///
    /// let trigger = Trigger::cron("0 30 9 * * Mon-Fri *").unwrap();
    /// assert!(trigger.is_recurring());
    /// assert!(Trigger::cron("not a cron expression").is_err());
    /// ```
    pub fn cron(expression: &str) -> Result<Self, TriggerError> {
        let schedule = Schedule::from_str(expression)?;
        Ok(Self::Cron {
            schedule: Box::new(schedule),
            expression: expression.to_owned(),
        })
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Once(_))
    }

    /// The first fire time for a job submitted at `now`.
    ///
    /// This is where submission-time validation happens: a one-shot time
    /// already in the past, a non-positive interval, or a cron schedule with
    /// no upcoming fire are all rejected here.
    pub(crate) fn first_fire(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, TriggerError> {
        match self {
            Self::Once(at) if *at < now - SCHEDULE_GRACE => Err(TriggerError::Past(*at)),
            Self::Once(at) => Ok((*at).max(now)),
            Self::Every(interval) if *interval <= TimeDelta::zero() => {
                Err(TriggerError::NonPositiveInterval(*interval))
            }
            Self::Every(interval) => Ok(now + *interval),
            Self::Cron { schedule, .. } => schedule
                .after(&now)
                .next()
                .ok_or(TriggerError::NoUpcomingFire),
        }
    }

    /// The next fire strictly after `anchor`, or `None` for one-shot
    /// triggers.
    pub(crate) fn next_fire(&self, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Once(_) => None,
            Self::Every(interval) => Some(anchor + *interval),
            Self::Cron { schedule, .. } => schedule.after(&anchor).next(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("scheduled time {0} is already in the past")]
    Past(DateTime<Utc>),
    #[error("recurrence interval {0} is not positive")]
    NonPositiveInterval(TimeDelta),
    #[error("cron schedule has no upcoming fire time")]
    NoUpcomingFire,
    #[error("malformed cron expression: {0}")]
    Cron(#[from] cron::error::Error),
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn once_in_the_future_is_valid() {
        let now = Utc::now();
        let at = now + TimeDelta::minutes(5);

        assert_eq!(Trigger::Once(at).first_fire(now).unwrap(), at);
    }

    #[test]
    fn once_in_the_past_is_rejected() {
        let now = Utc::now();
        let at = now - TimeDelta::minutes(5);

        assert_matches!(
            Trigger::Once(at).first_fire(now),
            Err(TriggerError::Past(_))
        );
    }

    #[test]
    fn once_within_grace_is_clamped_to_now() {
        let now = Utc::now();
        let at = now - TimeDelta::milliseconds(200);

        assert_eq!(Trigger::Once(at).first_fire(now).unwrap(), now);
    }

    #[test]
    fn non_positive_interval_is_rejected() {
        let now = Utc::now();

        assert_matches!(
            Trigger::Every(TimeDelta::zero()).first_fire(now),
            Err(TriggerError::NonPositiveInterval(_))
        );
        assert_matches!(
            Trigger::Every(TimeDelta::seconds(-1)).first_fire(now),
            Err(TriggerError::NonPositiveInterval(_))
        );
    }

    #[test]
    fn interval_fires_anchor_plus_interval() {
        let now = Utc::now();
        let interval = TimeDelta::seconds(30);
        let trigger = Trigger::Every(interval);

        let first = trigger.first_fire(now).unwrap();
        assert_eq!(first, now + interval);
        // Anchored on the previous fire, not on completion time.
        assert_eq!(trigger.next_fire(first).unwrap(), first + interval);
    }

    #[test]
    fn once_never_fires_again() {
        let now = Utc::now();
        assert!(Trigger::Once(now).next_fire(now).is_none());
    }

    #[test]
    fn malformed_cron_expression_is_rejected() {
        assert_matches!(Trigger::cron("not a cron"), Err(TriggerError::Cron(_)));
    }

    #[test]
    fn cron_with_no_upcoming_fire_is_rejected() {
        // Year field pinned to the past: well-formed, but never fires again.
        let trigger = Trigger::cron("0 0 0 1 1 * 2015").unwrap();

        assert_matches!(
            trigger.first_fire(Utc::now()),
            Err(TriggerError::NoUpcomingFire)
        );
    }

    #[test]
    fn cron_fires_strictly_after_anchor() {
        let trigger = Trigger::cron("0 * * * * * *").unwrap();
        let now = Utc::now();

        let first = trigger.first_fire(now).unwrap();
        assert!(first > now);
        assert!(trigger.next_fire(first).unwrap() > first);
    }
}
