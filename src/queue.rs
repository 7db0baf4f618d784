// Work queues: which subjects get crawled next, and when they go stale.
//
// All queue variants share one table and one repository; a `WorkQueue`
// only describes how its items are selected. An item is eligible when it
// was never scanned or was last scanned before the current calendar day,
// and its status matches the queue's eligibility marker (if any).

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::db::models::WorkStatus;

/// Selection rules for one named crawl queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkQueue {
    /// Stored in `work_items.queue`
    pub name: &'static str,
    /// Status an item must have to be selected. `None` selects any status.
    pub eligible_status: Option<WorkStatus>,
    /// Subjects already present in one of these queues are completed
    /// without being crawled.
    pub shadow_queues: &'static [&'static str],
    /// Accounts found on a subject's first page are queued here.
    pub auto_track_into: Option<&'static str>,
}

/// Daily refresh of user subjects assigned upstream.
pub const USER: WorkQueue = WorkQueue {
    name: "user",
    eligible_status: Some(WorkStatus::Completed),
    shadow_queues: &[],
    auto_track_into: None,
};

/// Daily refresh of tracked subjects. Their first-page follows feed the
/// auto-tracking queue.
pub const TRACKING: WorkQueue = WorkQueue {
    name: "tracking",
    eligible_status: Some(WorkStatus::Completed),
    shadow_queues: &[],
    auto_track_into: Some("auto-tracking"),
};

/// One-shot crawl of accounts discovered on a subject's first page.
pub const AUTO_TRACKING: WorkQueue = WorkQueue {
    name: "auto-tracking",
    eligible_status: Some(WorkStatus::New),
    shadow_queues: &["user", "tracking"],
    auto_track_into: None,
};

/// Key opinion leaders, refreshed daily regardless of status.
pub const KOL: WorkQueue = WorkQueue {
    name: "kol",
    eligible_status: None,
    shadow_queues: &[],
    auto_track_into: None,
};

pub const ALL: [WorkQueue; 4] = [USER, TRACKING, AUTO_TRACKING, KOL];

impl WorkQueue {
    /// Look up a built-in queue by its stored name.
    pub fn named(name: &str) -> Option<WorkQueue> {
        ALL.iter().copied().find(|q| q.name == name)
    }

    /// Status a queued item needs before this queue will pick it up.
    pub fn ready_status(&self) -> WorkStatus {
        self.eligible_status.unwrap_or(WorkStatus::New)
    }

    /// Items of this queue are claimed by moving `new → processing`.
    /// Other variants claim by stamping `last_scanned_at`.
    pub fn claims_by_status(&self) -> bool {
        self.eligible_status == Some(WorkStatus::New)
    }
}

/// The calendar day before `today`, rolling back across month and year
/// boundaries.
pub fn yesterday(today: NaiveDate) -> NaiveDate {
    let (year, month, day) = (today.year(), today.month(), today.day());

    let (y, m, d) = if day > 1 {
        (year, month, day - 1)
    } else if month == 1 {
        (year - 1, 12, 31)
    } else {
        (year, month - 1, days_in_month(year, month - 1))
    };

    NaiveDate::from_ymd_opt(y, m, d).unwrap_or(NaiveDate::MIN)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        _ if is_leap_year(year) => 29,
        _ => 28,
    }
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// The midnight that ends yesterday. Anything scanned strictly before it is
/// stale; anything scanned on the current calendar day is not.
pub fn staleness_cutoff(now: NaiveDateTime) -> NaiveDateTime {
    yesterday(now.date()).and_time(NaiveTime::MIN) + Duration::days(1)
}
