//! Periodic jobs and the adaptive state-poll cadence.

use crate::states;
use std::collections::BTreeMap;
use std::time::Duration;

/// State poll period while the mower is out on the lawn.
pub(crate) const SAMPLING_PERIOD: Duration = Duration::new(7, 0);
/// Re-issue the position request after this many state polls of sampling.
pub(crate) const REARM_POLLS: u32 = 90;
/// Delay between calendar save attempts.
pub(crate) const SAVE_RETRY: Duration = Duration::new(60, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Job {
    State,
    OperatingData,
    Alerts,
    Calendars,
    RefreshToken,
    DeviceData,
    Weather,
    NextTime,
    SaveCalendar,
    SavePredictiveCalendar,
}

impl Job {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Job::State => "get_state",
            Job::OperatingData => "operating_data",
            Job::Alerts => "alert",
            Job::Calendars => "get_all_calendars",
            Job::RefreshToken => "refresh_token",
            Job::DeviceData => "device_data",
            Job::Weather => "get_weather",
            Job::NextTime => "get_next_time",
            Job::SaveCalendar => "save_calendar",
            Job::SavePredictiveCalendar => "save_predictive_calendar",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    period: Option<Duration>,
    next: boot_time::Instant,
}

fn after(now: boot_time::Instant, delay: Duration) -> boot_time::Instant {
    now.checked_add(delay).unwrap_or(now)
}

/// Jobs with their next deadline. Periodic jobs are re-armed relative to the
/// time they were handed out, so an overrun skips ticks instead of bunching
/// them up.
#[derive(Debug, Default)]
pub(crate) struct Schedule {
    entries: BTreeMap<Job, Entry>,
}

impl Schedule {
    /// Run `job` every `period`, the first time at `first`.
    pub(crate) fn every(&mut self, job: Job, period: Duration, first: boot_time::Instant) {
        self.entries.insert(
            job,
            Entry {
                period: Some(period),
                next: first,
            },
        );
    }

    /// Run `job` once, `delay` from `now`.
    pub(crate) fn once(&mut self, job: Job, delay: Duration, now: boot_time::Instant) {
        self.entries.insert(
            job,
            Entry {
                period: None,
                next: after(now, delay),
            },
        );
    }

    /// Change the period of `job`; the next run happens one new period from `now`.
    pub(crate) fn change(&mut self, job: Job, period: Duration, now: boot_time::Instant) {
        match self.entries.get_mut(&job) {
            Some(entry) if entry.period == Some(period) => {}
            Some(entry) => {
                tracing::debug!(job = job.name(), ?period, "changing job period");
                entry.period = Some(period);
                entry.next = after(now, period);
            }
            None => self.every(job, period, after(now, period)),
        }
    }

    pub(crate) fn period(&self, job: Job) -> Option<Duration> {
        self.entries.get(&job).and_then(|e| e.period)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, job: Job) -> bool {
        self.entries.contains_key(&job)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Hand out every job due at `now` and re-arm or drop it.
    pub(crate) fn due(&mut self, now: boot_time::Instant) -> Vec<Job> {
        let mut due = Vec::new();
        self.entries.retain(|job, entry| {
            if entry.next > now {
                return true;
            }
            due.push(*job);
            match entry.period {
                Some(period) => {
                    entry.next = after(now, period);
                    true
                }
                None => false,
            }
        });
        due
    }

    pub(crate) fn next_deadline(&self) -> Option<boot_time::Instant> {
        self.entries.values().map(|e| e.next).min()
    }

    /// How long to sleep from `now` until something is due.
    pub(crate) fn sleep_for(&self, now: boot_time::Instant) -> Option<Duration> {
        let next = self.next_deadline()?;
        if next <= now {
            Some(Duration::ZERO)
        } else {
            Some(next.duration_since(now))
        }
    }
}

/// What the state poll has to do after observing a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    /// Request positions and switch to the sampling period.
    StartSampling,
    /// Still sampling; the position request ran out and needs re-issuing.
    Rearm,
    /// Back to the configured period.
    StopSampling,
    Hold,
}

/// Position sampling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Cadence {
    #[default]
    Idle,
    Sampling {
        polls: u32,
    },
}

impl Cadence {
    pub(crate) fn observe(&mut self, code: u32) -> Transition {
        if let Cadence::Sampling { polls } = self {
            *polls += 1;
        }
        if states::is_active(code) {
            return match self {
                Cadence::Idle => {
                    *self = Cadence::Sampling { polls: 0 };
                    Transition::StartSampling
                }
                Cadence::Sampling { polls } if *polls >= REARM_POLLS => {
                    *polls = 0;
                    Transition::Rearm
                }
                Cadence::Sampling { .. } => Transition::Hold,
            };
        }
        if states::is_terminal(code) && *self != Cadence::Idle {
            *self = Cadence::Idle;
            return Transition::StopSampling;
        }
        Transition::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_come_due_in_order() {
        let now = boot_time::Instant::now();
        let mut schedule = Schedule::default();
        schedule.every(Job::Weather, Duration::from_secs(600), now);
        schedule.every(Job::State, Duration::from_secs(30), now);
        schedule.once(Job::SaveCalendar, SAVE_RETRY, now);
        assert_eq!(schedule.due(now), vec![Job::State, Job::Weather]);
        assert!(schedule.due(now).is_empty());
        let later = now.checked_add(Duration::from_secs(61)).unwrap();
        assert_eq!(schedule.due(later), vec![Job::State, Job::SaveCalendar]);
        assert!(!schedule.contains(Job::SaveCalendar));
        assert_eq!(
            schedule.sleep_for(later),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn changing_the_period_re_arms() {
        let now = boot_time::Instant::now();
        let mut schedule = Schedule::default();
        schedule.every(Job::State, Duration::from_secs(30), now);
        schedule.due(now);
        schedule.change(Job::State, SAMPLING_PERIOD, now);
        assert_eq!(schedule.period(Job::State), Some(SAMPLING_PERIOD));
        assert_eq!(schedule.sleep_for(now), Some(SAMPLING_PERIOD));
    }

    #[test]
    fn sampling_cycle() {
        let mut cadence = Cadence::default();
        assert_eq!(cadence.observe(258), Transition::Hold);
        assert_eq!(cadence.observe(518), Transition::StartSampling);
        for _ in 1..REARM_POLLS {
            assert_eq!(cadence.observe(518), Transition::Hold);
        }
        assert_eq!(cadence.observe(513), Transition::Rearm);
        assert_eq!(cadence.observe(775), Transition::StopSampling);
        assert_eq!(cadence, Cadence::Idle);
        assert_eq!(cadence.observe(258), Transition::Hold);
    }
}
