use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone};
use tokio::time::{Duration, Instant};

use worldsaver_core::{CoreError, Result};

use crate::config::Trigger;

/// Next local wall-clock occurrence of `at` strictly after `now`.
///
/// A time that falls into a DST gap moves forward by the gap; an ambiguous
/// time resolves to its first occurrence.
pub fn next_daily_run(now: DateTime<Local>, at: NaiveTime) -> Result<DateTime<Local>> {
    let mut day = now.date_naive();
    for _ in 0..3 {
        let naive = day.and_time(at);
        let candidate = Local
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                Local
                    .from_local_datetime(&(naive + ChronoDuration::hours(1)))
                    .earliest()
            });
        if let Some(candidate) = candidate {
            if candidate > now {
                return Ok(candidate);
            }
        }
        day = day
            .succ_opt()
            .ok_or_else(|| CoreError::DateOutOfRange(format!("day after {day}")))?;
    }
    Err(CoreError::DateOutOfRange(format!("no local time {at} after {now}")))
}

/// Monotonic deadline of the next scheduled pass, and whether it is the daily one.
pub fn next_deadline(trigger: &Trigger, now: DateTime<Local>) -> Result<(Instant, bool)> {
    match trigger {
        Trigger::Interval(period) => Ok((Instant::now() + *period, false)),
        Trigger::Daily(at) => {
            let next = next_daily_run(now, *at)?;
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            Ok((Instant::now() + wait, true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(day: u32, hour: u32, minute: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 5, day, hour, minute, 0)
            .single()
            .expect("unambiguous local time")
    }

    fn at(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).expect("valid time")
    }

    #[test]
    fn later_today_runs_today() {
        assert_eq!(
            next_daily_run(local(20, 1, 0), at(3, 30)).unwrap(),
            local(20, 3, 30)
        );
    }

    #[test]
    fn passed_or_current_time_runs_tomorrow() {
        assert_eq!(
            next_daily_run(local(20, 3, 30), at(3, 30)).unwrap(),
            local(21, 3, 30)
        );
        assert_eq!(
            next_daily_run(local(20, 23, 59), at(0, 0)).unwrap(),
            local(21, 0, 0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn interval_deadline_is_one_period_away() {
        let start = Instant::now();
        let (deadline, daily) =
            next_deadline(&Trigger::Interval(Duration::from_secs(600)), Local::now()).unwrap();
        assert!(!daily);
        assert_eq!(deadline - start, Duration::from_secs(600));
    }
}
