use crate::models::{PricePoint, RebalanceFrequency};
use chrono::{Months, NaiveDate};
use std::collections::BTreeSet;

/// Rebalance dates anchored at `start`: start, start + 1 period, ... while
/// `<= end`. Days past the end of a short month clamp to its last day.
pub fn rebalance_dates(
    start: NaiveDate,
    end: NaiveDate,
    frequency: RebalanceFrequency,
) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let step = frequency.months();
    let mut k: u32 = 0;

    while let Some(date) = start.checked_add_months(Months::new(k * step)) {
        if date > end {
            break;
        }
        dates.push(date);
        k += 1;
    }

    dates
}

/// Every date the simulation visits: the rebalance dates plus each price date
/// inside `[start, end]` of the supplied series.
pub fn build_timeline<'a, I>(
    start: NaiveDate,
    end: NaiveDate,
    rebalance_dates: &[NaiveDate],
    series: I,
) -> Vec<NaiveDate>
where
    I: IntoIterator<Item = &'a [PricePoint]>,
{
    let mut dates: BTreeSet<NaiveDate> = rebalance_dates.iter().copied().collect();
    for points in series {
        let from = points.partition_point(|p| p.date < start);
        for point in &points[from..] {
            if point.date > end {
                break;
            }
            dates.insert(point.date);
        }
    }
    dates.into_iter().collect()
}

/// Drops quotes older than `max_age_days` relative to `date`.
pub fn fresh_price(point: Option<PricePoint>, date: NaiveDate, max_age_days: i64) -> Option<f64> {
    let point = point?;
    if (date - point.date).num_days() > max_age_days {
        None
    } else {
        Some(point.close)
    }
}
