use std::time::SystemTime;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

// A fixed pairing of Instant and SystemTime so the engine can be driven purely by
// caller-supplied Instants while still stamping cookies with wall-clock time.
// Both halves are taken as close together as possible, the error is small.
static BEGINNING_OF_TIME: Lazy<(Instant, SystemTime)> = Lazy::new(|| {
    let now = Instant::now();
    let now_sys = SystemTime::now();

    // Find an Instant in the past which is up to an hour back.
    let beginning_of_time = {
        let mut secs = 3600;
        loop {
            if let Some(v) = now.checked_sub(Duration::from_secs(secs)) {
                break v;
            }
            secs -= 1;
            if secs == 0 {
                break now;
            }
        }
    };

    let since_beginning_of_time = now - beginning_of_time;
    (beginning_of_time, now_sys - since_beginning_of_time)
});

pub trait InstantExt {
    /// Wall-clock time of this Instant as a duration since the unix epoch.
    fn to_unix_duration(&self) -> Duration;

    /// Same as [`InstantExt::to_unix_duration`] in whole milliseconds.
    fn to_unix_millis(&self) -> u64 {
        self.to_unix_duration().as_millis() as u64
    }
}

impl InstantExt for Instant {
    fn to_unix_duration(&self) -> Duration {
        if *self < BEGINNING_OF_TIME.0 {
            warn!("Instant predates beginning_of_time, clamping");
        }

        let since_time_0 = self.saturating_duration_since(BEGINNING_OF_TIME.0);
        let system_time = BEGINNING_OF_TIME.1 + since_time_0;

        system_time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}
