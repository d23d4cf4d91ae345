use chrono::{DateTime, Duration, Utc};

/// Cancellation window check: a booking may be cancelled only while at least
/// `lead_hours` remain before the class starts. The boundary itself is
/// allowed. Callers must pass the same `now` they persist alongside the
/// transition so the check and the commit cannot disagree.
pub fn is_allowed(class_start: DateTime<Utc>, now: DateTime<Utc>, lead_hours: i64) -> bool {
    class_start - now >= Duration::hours(lead_hours)
}

/// Latest instant at which cancellation is still permitted.
pub fn window_closes_at(class_start: DateTime<Utc>, lead_hours: i64) -> DateTime<Utc> {
    class_start - Duration::hours(lead_hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn class_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, 18, 0, 0).single().unwrap()
    }

    #[test]
    fn well_before_the_window_is_allowed() {
        let now = class_start() - Duration::hours(12);
        assert!(is_allowed(class_start(), now, 4));
    }

    #[test]
    fn exactly_at_the_boundary_is_allowed() {
        let now = class_start() - Duration::hours(4);
        assert!(is_allowed(class_start(), now, 4));
    }

    #[test]
    fn one_second_past_the_boundary_is_refused() {
        let now = class_start() - Duration::hours(4) + Duration::seconds(1);
        assert!(!is_allowed(class_start(), now, 4));
    }

    #[test]
    fn after_class_start_is_refused() {
        let now = class_start() + Duration::minutes(5);
        assert!(!is_allowed(class_start(), now, 4));
    }

    #[test]
    fn zero_lead_allows_until_start() {
        assert!(is_allowed(class_start(), class_start(), 0));
        assert!(!is_allowed(
            class_start(),
            class_start() + Duration::seconds(1),
            0
        ));
    }

    #[test]
    fn window_close_matches_the_boundary() {
        let closes = window_closes_at(class_start(), 4);
        assert!(is_allowed(class_start(), closes, 4));
        assert!(!is_allowed(class_start(), closes + Duration::seconds(1), 4));
    }
}
