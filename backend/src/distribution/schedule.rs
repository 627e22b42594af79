// Weekly schedule gating. A queue only takes leads inside its configured
// windows; outside them the lead routes to the pool even when a rule matched.

use chrono::{DateTime, Datelike, Utc};

use lattice_shared::ScheduleWindow;

/// Whether the queue is open at `at`. A queue with no windows configured is
/// always open; a queue whose windows are all disabled is always closed.
pub fn is_open(windows: &[ScheduleWindow], at: DateTime<Utc>) -> bool {
    if windows.is_empty() {
        return true;
    }

    let day = at.weekday().num_days_from_monday() as i16;
    let time = at.time();

    windows
        .iter()
        .filter(|w| w.enabled && w.day == day)
        .any(|w| time >= w.start_time && time <= w.end_time)
}
