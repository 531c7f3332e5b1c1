use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{Days, Local, NaiveDateTime, NaiveTime};

const PROBE_GRACE: Duration = Duration::from_secs(3);

/// Arranges the daily restart: at the next occurrence of `hour` local time
/// the liveness flag goes false, probes get [`PROBE_GRACE`] to observe it,
/// and the process exits 0 so the platform reschedules a fresh pod.
pub fn schedule_daily_restart(alive: Arc<AtomicBool>, hour: u32) {
    tokio::spawn(async move {
        let delay = next_restart_delay(Local::now().naive_local(), hour);
        tracing::info!(hour, in_secs = delay.as_secs(), "daily restart scheduled");
        tokio::time::sleep(delay).await;

        tracing::warn!("scheduled restart reached, failing liveness");
        alive.store(false, Ordering::SeqCst);
        tokio::time::sleep(PROBE_GRACE).await;
        std::process::exit(0);
    });
}

/// Delay from `now` to the next occurrence of `hour`:00:00. Booting exactly
/// on the hour waits a full day instead of restarting immediately.
pub fn next_restart_delay(now: NaiveDateTime, hour: u32) -> Duration {
    let restart_at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let date = if now.time() < restart_at {
        now.date()
    } else {
        now.date()
            .checked_add_days(Days::new(1))
            .unwrap_or(now.date())
    };
    (date.and_time(restart_at) - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, min: u32, sec: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 17)
            .unwrap()
            .and_hms_opt(hour, min, sec)
            .unwrap()
    }

    #[test]
    fn before_the_hour_waits_until_today() {
        assert_eq!(next_restart_delay(at(1, 0, 0), 2), Duration::from_secs(3600));
        assert_eq!(next_restart_delay(at(0, 0, 1), 2), Duration::from_secs(7199));
    }

    #[test]
    fn after_the_hour_waits_until_tomorrow() {
        assert_eq!(
            next_restart_delay(at(3, 0, 0), 2),
            Duration::from_secs(23 * 3600)
        );
    }

    #[test]
    fn exactly_on_the_hour_waits_a_full_day() {
        assert_eq!(
            next_restart_delay(at(2, 0, 0), 2),
            Duration::from_secs(24 * 3600)
        );
    }

    #[test]
    fn midnight_hour_rolls_to_next_day() {
        assert_eq!(
            next_restart_delay(at(23, 59, 0), 0),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn delay_never_exceeds_one_day() {
        for hour in [0, 2, 13, 23] {
            for now_hour in 0..24 {
                let delay = next_restart_delay(at(now_hour, 30, 0), hour);
                assert!(delay <= Duration::from_secs(24 * 3600));
                assert!(delay > Duration::ZERO);
            }
        }
    }
}
