// Contract expiration codes -> delivery instants
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};

/// Delivery instant for an expiration code, as of `now`.
///
/// Contracts deliver on Fridays at `delivery_hour` UTC:
/// `CW` the first delivery after `now`, `NW` the week after,
/// `CQ` the last Friday of the quarter (rolling once it has passed),
/// `NQ` the quarter after `CQ`. Unknown codes give `None`.
pub fn contract_delivery_time(
    expiration: &str,
    delivery_hour: u32,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match expiration {
        "CW" => this_week(delivery_hour, now),
        "NW" => this_week(delivery_hour, now).map(|t| t + Duration::days(7)),
        "CQ" => this_quarter(delivery_hour, now).map(|(_, t)| t),
        "NQ" => {
            let ((year, quarter), _) = this_quarter(delivery_hour, now)?;
            let (year, quarter) = next_quarter(year, quarter);
            quarter_delivery(year, quarter, delivery_hour)
        }
        _ => None,
    }
}

fn at_hour(date: NaiveDate, hour: u32) -> Option<DateTime<Utc>> {
    Utc.from_local_datetime(&date.and_hms_opt(hour, 0, 0)?).single()
}

fn this_week(hour: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = now.date_naive();
    let ahead = (Weekday::Fri.num_days_from_monday() + 7
        - today.weekday().num_days_from_monday())
        % 7;
    let friday = at_hour(today + Duration::days(i64::from(ahead)), hour)?;
    Some(if friday <= now { friday + Duration::days(7) } else { friday })
}

fn next_quarter(year: i32, quarter: u32) -> (i32, u32) {
    if quarter == 4 {
        (year + 1, 1)
    } else {
        (year, quarter + 1)
    }
}

// last Friday of the quarter's final month
fn quarter_delivery(year: i32, quarter: u32, hour: u32) -> Option<DateTime<Utc>> {
    let (next_year, next_q) = next_quarter(year, quarter);
    let first_of_next = NaiveDate::from_ymd_opt(next_year, (next_q - 1) * 3 + 1, 1)?;
    let mut day = first_of_next.pred_opt()?;
    while day.weekday() != Weekday::Fri {
        day = day.pred_opt()?;
    }
    at_hour(day, hour)
}

fn this_quarter(hour: u32, now: DateTime<Utc>) -> Option<((i32, u32), DateTime<Utc>)> {
    let current = (now.year(), (now.month() - 1) / 3 + 1);
    let delivery = quarter_delivery(current.0, current.1, hour)?;
    if delivery > now {
        return Some((current, delivery));
    }
    let rolled = next_quarter(current.0, current.1);
    Some((rolled, quarter_delivery(rolled.0, rolled.1, hour)?))
}
