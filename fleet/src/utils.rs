use rand::Rng;
use std::time::Duration;

// Get a retry delay around `base`, jittered by up to a quarter either way
pub fn retry_delay(base: Duration) -> Duration {
    let millis = base.as_millis().min(u64::MAX as u128) as u64;
    if millis < 4 {
        return base;
    }
    let spread = millis / 4;
    let jittered = rand::thread_rng().gen_range(millis - spread..=millis.saturating_add(spread));
    Duration::from_millis(jittered)
}

// Format an elapsed split the way runners read it: 1h2m3s, 1m0s, 45s
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total / 60) % 60, total % 60);

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

// Elapsed time between two wall-clock stamps. Stamps only carry time of day,
// so an end before the start means the attempt crossed midnight.
pub fn split_between(start: chrono::DateTime<chrono::Utc>, end: chrono::DateTime<chrono::Utc>) -> Duration {
    let mut delta = end - start;
    if delta < chrono::Duration::zero() {
        delta = delta + chrono::Duration::days(1);
    }
    delta.to_std().unwrap_or(Duration::ZERO)
}
