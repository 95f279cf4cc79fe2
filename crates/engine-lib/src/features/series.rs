//! Daily resampling with bounded gap interpolation
//!
//! Observations are collapsed to one price per calendar day. Short gaps are
//! filled by linear interpolation; gaps longer than the bound are left out
//! entirely so rolling statistics never see fabricated trend.

use crate::models::PriceObservation;
use chrono::NaiveDate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    Observed,
    Interpolated,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyPoint {
    pub day: NaiveDate,
    pub price: f64,
    pub kind: PointKind,
}

/// Daily price series; days inside long gaps are absent
#[derive(Debug, Clone, Default)]
pub struct DailySeries {
    points: Vec<DailyPoint>,
    excluded_days: u32,
}

impl DailySeries {
    /// Build from observations sorted oldest first
    pub fn from_observations(observations: &[PriceObservation], max_gap: u32) -> Self {
        let mut days: Vec<(NaiveDate, f64)> = Vec::new();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut current: Option<NaiveDate> = None;

        for observation in observations {
            let day = observation.day();
            if current != Some(day) {
                if let Some(prev) = current {
                    days.push((prev, weighted_sum / weight_total));
                }
                current = Some(day);
                weighted_sum = 0.0;
                weight_total = 0.0;
            }
            let weight = observation.source_quality.weight();
            weighted_sum += observation.price * weight;
            weight_total += weight;
        }
        if let Some(prev) = current {
            days.push((prev, weighted_sum / weight_total));
        }

        let mut points = Vec::with_capacity(days.len());
        let mut excluded_days = 0u32;

        for (i, &(day, price)) in days.iter().enumerate() {
            if let Some(&(prev_day, prev_price)) = i.checked_sub(1).and_then(|j| days.get(j)) {
                let missing = (day - prev_day).num_days() - 1;
                if missing > 0 && missing <= max_gap as i64 {
                    let steps = (missing + 1) as f64;
                    for k in 1..=missing {
                        points.push(DailyPoint {
                            day: prev_day + chrono::Duration::days(k),
                            price: prev_price + (price - prev_price) * k as f64 / steps,
                            kind: PointKind::Interpolated,
                        });
                    }
                } else if missing > 0 {
                    excluded_days = excluded_days.saturating_add(missing as u32);
                }
            }
            points.push(DailyPoint {
                day,
                price,
                kind: PointKind::Observed,
            });
        }

        Self {
            points,
            excluded_days,
        }
    }

    pub fn points(&self) -> &[DailyPoint] {
        &self.points
    }

    pub fn last(&self) -> Option<&DailyPoint> {
        self.points.last()
    }

    /// Points in the trailing `periods` days ending at the last point
    pub fn trailing(&self, periods: u32) -> &[DailyPoint] {
        let Some(last) = self.last() else {
            return &[];
        };
        let cutoff = last.day - chrono::Duration::days(periods as i64);
        let start = self.points.partition_point(|p| p.day <= cutoff);
        &self.points[start..]
    }

    pub fn observed(&self) -> impl Iterator<Item = &DailyPoint> {
        self.points.iter().filter(|p| p.kind == PointKind::Observed)
    }

    /// Days left out because they sat inside gaps longer than the bound
    pub fn excluded_days(&self) -> u32 {
        self.excluded_days
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
