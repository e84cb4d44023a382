//! Timezone validation and all-day boundary helpers

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::GraphError;

/// Parse an IANA timezone string
pub fn parse_timezone(tz_str: &str) -> Result<Tz, GraphError> {
    tz_str
        .parse::<Tz>()
        .map_err(|_| GraphError::Validation(format!("invalid timezone: {tz_str}")))
}

/// Validate an IANA timezone string without keeping the parse result
pub fn validate_timezone(tz_str: &str) -> Result<(), GraphError> {
    parse_timezone(tz_str).map(|_| ())
}

/// The UTC instant of local midnight for `date` in `tz`.
///
/// All-day events block from local midnight to the next local midnight when
/// the user's profile carries a timezone; DST gaps resolve to the earliest
/// valid instant of the day.
pub fn local_midnight_utc(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.with_timezone(&Utc)
        }
        chrono::LocalResult::None => {
            // Midnight skipped by a DST jump; take the earliest instant after
            tz.from_local_datetime(&naive)
                .earliest()
                .map_or_else(|| Utc.from_utc_datetime(&naive), |dt| dt.with_timezone(&Utc))
        }
    }
}
