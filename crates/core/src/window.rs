//! WhatsApp 24-hour customer-initiated messaging window.
//!
//! Window state is never stored: it is recomputed on read from the thread's
//! `last_inbound_at`, so there is no background job to flip it and no stale
//! "closed" row to repair. Only a genuine inbound message opens or extends
//! the window; outbound sends never do.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const WINDOW_HOURS: i64 = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    Open,
    Closed,
}

pub fn window_state(last_inbound_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> WindowState {
    match last_inbound_at {
        Some(at) if now - at < Duration::hours(WINDOW_HOURS) => WindowState::Open,
        _ => WindowState::Closed,
    }
}

pub fn is_window_open(last_inbound_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    window_state(last_inbound_at, now) == WindowState::Open
}

/// When the current window lapses, or `None` if no inbound message has ever
/// opened one.
pub fn window_expires_at(last_inbound_at: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    last_inbound_at.map(|at| at + Duration::hours(WINDOW_HOURS))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{is_window_open, window_expires_at, window_state, WindowState};

    #[test]
    fn window_is_open_just_inside_24_hours() {
        let now = Utc::now();
        let last_inbound = now - (Duration::hours(23) + Duration::minutes(59));
        assert!(is_window_open(Some(last_inbound), now));
    }

    #[test]
    fn window_is_closed_just_past_24_hours() {
        let now = Utc::now();
        let last_inbound = now - (Duration::hours(24) + Duration::minutes(1));
        assert!(!is_window_open(Some(last_inbound), now));
    }

    #[test]
    fn window_is_closed_at_exactly_24_hours() {
        let now = Utc::now();
        let last_inbound = now - Duration::hours(24);
        assert_eq!(window_state(Some(last_inbound), now), WindowState::Closed);
    }

    #[test]
    fn window_never_opened_without_inbound() {
        let now = Utc::now();
        assert_eq!(window_state(None, now), WindowState::Closed);
        assert_eq!(window_expires_at(None), None);
    }

    #[test]
    fn expiry_is_last_inbound_plus_24_hours() {
        let at = Utc::now();
        assert_eq!(window_expires_at(Some(at)), Some(at + Duration::hours(24)));
    }
}
