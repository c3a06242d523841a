//! Timer/timeout utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::ViewstampError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Far enough in the future to count as "never" for a disarmed timer.
const DISARMED: Duration = Duration::from_secs(86400 * 365);

/// Timer utility for signalling after a given timeout. Supports re-arming
/// before expiry, which is how the backup view timer gets pushed back on
/// every prepare heard from the primary.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Timeout duration used by the last kick-off.
    last_dur: Duration,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Creates a new timer utility that is initially disarmed.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(DISARMED)),
            last_dur: Duration::ZERO,
        }
    }

    /// Arms (or re-arms) the timer with the given duration, counting from now.
    pub fn kickoff(&mut self, dur: Duration) -> Result<(), ViewstampError> {
        if dur.is_zero() {
            return Err(ViewstampError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Re-arms the timer with the duration of the last kick-off.
    pub fn rekick(&mut self) -> Result<(), ViewstampError> {
        self.kickoff(self.last_dur)
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`. A disarmed timer never fires.
    pub async fn timeout(&mut self) {
        self.sleep.as_mut().await;
    }
}
