//! Per-sensor mute windows.
//!
//! Each alert type moves `unmuted -> muted (until T) -> unmuted`, either when
//! a sweep observes `now >= T` or when the window is cleared explicitly.

use chrono::{DateTime, Utc};

use super::{AlertType, PerAlert};

// ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuteWindows(PerAlert<Option<DateTime<Utc>>>);

impl MuteWindows {
    // ---
    /// Mute `alert_type` until `until`. An expiry that is not in the future
    /// is treated as already expired and leaves the windows untouched.
    pub fn set(&mut self, alert_type: AlertType, until: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if until <= now {
            return false;
        }
        self.0[alert_type] = Some(until);
        true
    }

    /// Remove the window for `alert_type`; returns whether one was set.
    pub fn clear(&mut self, alert_type: AlertType) -> bool {
        self.0[alert_type].take().is_some()
    }

    pub fn is_muted(&self, alert_type: AlertType, now: DateTime<Utc>) -> bool {
        self.0[alert_type].is_some_and(|until| until > now)
    }

    pub fn expiry(&self, alert_type: AlertType) -> Option<DateTime<Utc>> {
        self.0[alert_type]
    }

    /// Clear every window whose expiry is at or before `now` and return the
    /// types that were unmuted.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<AlertType> {
        // ---
        let mut expired = Vec::new();
        for alert_type in AlertType::ALL {
            if self.0[alert_type].is_some_and(|until| until <= now) {
                self.0[alert_type] = None;
                expired.push(alert_type);
            }
        }
        expired
    }

    pub fn expiries(&self) -> &PerAlert<Option<DateTime<Utc>>> {
        &self.0
    }
}
