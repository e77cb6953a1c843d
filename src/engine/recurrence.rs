use chrono::{Duration, Months};

use crate::limits::MAX_OCCURRENCES;
use crate::model::{Recurrence, Span};

use super::EngineError;

/// Expand a base range into its concrete occurrences.
///
/// Weekly repeats at `base.start + 7k days`; monthly repeats anchor every
/// step on the base start (`base.start + k months`), so a Jan 31 booking
/// lands on Feb 29 and then Mar 31 rather than drifting to the 28th/29th
/// forever. The duration of the base range is held constant throughout.
///
/// The loop condition is evaluated for the base occurrence first: an `until`
/// date before the base date expands to nothing, and the caller decides what
/// an empty batch means.
pub fn expand(base: Span, rule: &Recurrence) -> Result<Vec<Span>, EngineError> {
    let duration = base.duration();
    match rule {
        Recurrence::Once => Ok(vec![base]),
        Recurrence::Weekly { until } => {
            let mut out = Vec::new();
            for k in 0i64.. {
                let start = base.start + Duration::weeks(k);
                if start.date_naive() > *until {
                    break;
                }
                if out.len() >= MAX_OCCURRENCES {
                    return Err(EngineError::LimitExceeded("too many occurrences"));
                }
                out.push(Span::new(start, start + duration));
            }
            Ok(out)
        }
        Recurrence::Monthly { until } => {
            let mut out = Vec::new();
            for k in 0u32.. {
                let Some(start) = base.start.checked_add_months(Months::new(k)) else {
                    break;
                };
                if start.date_naive() > *until {
                    break;
                }
                if out.len() >= MAX_OCCURRENCES {
                    return Err(EngineError::LimitExceeded("too many occurrences"));
                }
                out.push(Span::new(start, start + duration));
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    fn date(y: i32, mo: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, mo, d).unwrap()
    }

    #[test]
    fn once_yields_base() {
        let base = Span::new(at(2030, 6, 3, 10), at(2030, 6, 3, 11));
        let occs = expand(base, &Recurrence::Once).unwrap();
        assert_eq!(occs, vec![base]);
    }

    #[test]
    fn weekly_expansion() {
        let base = Span::new(at(2030, 6, 3, 10), at(2030, 6, 3, 11));
        let occs = expand(base, &Recurrence::Weekly { until: date(2030, 6, 24) }).unwrap();
        // Jun 3, 10, 17, 24 — the end date itself is included.
        assert_eq!(occs.len(), 4);
        assert_eq!(occs[1].start, at(2030, 6, 10, 10));
        assert_eq!(occs[3].start, at(2030, 6, 24, 10));
        for occ in &occs {
            assert_eq!(occ.duration(), Duration::hours(1));
        }
    }

    #[test]
    fn weekly_until_mid_week_stops_before() {
        let base = Span::new(at(2030, 6, 3, 10), at(2030, 6, 3, 11));
        // Until Jun 12: Jun 10 included, Jun 17 not.
        let occs = expand(base, &Recurrence::Weekly { until: date(2030, 6, 12) }).unwrap();
        assert_eq!(occs.len(), 2);
    }

    #[test]
    fn weekly_until_base_date_yields_one() {
        let base = Span::new(at(2030, 6, 3, 10), at(2030, 6, 3, 11));
        let occs = expand(base, &Recurrence::Weekly { until: date(2030, 6, 3) }).unwrap();
        assert_eq!(occs, vec![base]);
    }

    #[test]
    fn until_before_base_yields_nothing() {
        let base = Span::new(at(2030, 6, 3, 10), at(2030, 6, 3, 11));
        let weekly = expand(base, &Recurrence::Weekly { until: date(2030, 6, 2) }).unwrap();
        assert!(weekly.is_empty());
        let monthly = expand(base, &Recurrence::Monthly { until: date(2030, 5, 1) }).unwrap();
        assert!(monthly.is_empty());
    }

    #[test]
    fn monthly_clamps_to_month_end_without_drifting() {
        // Jan 31 → Feb 29 (2024 is a leap year) → Mar 31, each 1 hour long.
        let base = Span::new(at(2024, 1, 31, 10), at(2024, 1, 31, 11));
        let occs = expand(base, &Recurrence::Monthly { until: date(2024, 3, 31) }).unwrap();
        assert_eq!(occs.len(), 3);
        assert_eq!(occs[0].start, at(2024, 1, 31, 10));
        assert_eq!(occs[1].start, at(2024, 2, 29, 10));
        assert_eq!(occs[2].start, at(2024, 3, 31, 10));
        for occ in &occs {
            assert_eq!(occ.duration(), Duration::hours(1));
        }
    }

    #[test]
    fn monthly_plain() {
        let base = Span::new(at(2030, 6, 15, 14), at(2030, 6, 15, 15));
        let occs = expand(base, &Recurrence::Monthly { until: date(2030, 9, 15) }).unwrap();
        assert_eq!(occs.len(), 4); // Jun, Jul, Aug, Sep
        assert_eq!(occs[3].start, at(2030, 9, 15, 14));
    }

    #[test]
    fn occurrence_cap_enforced() {
        let base = Span::new(at(2030, 6, 3, 10), at(2030, 6, 3, 11));
        let result = expand(base, &Recurrence::Weekly { until: date(2040, 6, 3) });
        assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
    }
}
