use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};

/// Maps an instant to the battle day it belongs to.
///
/// A battle day begins at `day_begin` (e.g. 03:00 UTC) rather than midnight:
/// contests scheduled just after midnight belong to the previous day's
/// bracket.
pub fn battle_day(start: DateTime<Utc>, day_begin: NaiveTime) -> NaiveDate {
    let date = start.date_naive();
    let day_start = date.and_time(day_begin).and_utc();

    if start >= day_start {
        date
    } else {
        date - Duration::days(1)
    }
}
