//! Health/performance timeline correlation.
//!
//! Health timestamps are the shared axis. The performance series is resampled
//! onto the health point count by index: health point `i` of `n` reads the
//! performance series at position `i·(m−1)/(n−1)`, interpolating between the
//! two neighbouring points. Positions never leave the performance span.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sampling::SampleSeries;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedPoint {
    pub at: DateTime<Utc>,
    pub temperature_c: f64,
    pub iops: f64,
    pub latency_us: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedTimeline {
    pub workload: String,
    pub points: Vec<CorrelatedPoint>,
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

fn sample_at(values: &[Option<f64>], pos: f64) -> Option<f64> {
    let last = values.len().checked_sub(1)?;
    let lo = (pos.floor() as usize).min(last);
    let hi = (lo + 1).min(last);
    let t = pos - lo as f64;
    match (values[lo], values[hi]) {
        (Some(a), Some(b)) => Some(lerp(a, b, t)),
        (a, b) => {
            if t < 0.5 {
                a.or(b)
            } else {
                b.or(a)
            }
        }
    }
}

/// `None` when either side has fewer than two readings.
pub fn correlate(
    workload: &str,
    temperature: &SampleSeries,
    iops: &SampleSeries,
    latency: &SampleSeries,
) -> Option<CorrelatedTimeline> {
    let health: Vec<(DateTime<Utc>, f64)> = temperature.readings().collect();

    // Keep latency aligned with the iops readings it was derived with.
    let mut perf_iops = Vec::new();
    let mut perf_lat = Vec::new();
    for (k, s) in iops.samples.iter().enumerate() {
        if let Some(v) = s.value {
            perf_iops.push(Some(v));
            perf_lat.push(latency.samples.get(k).and_then(|l| l.value));
        }
    }

    let (n, m) = (health.len(), perf_iops.len());
    if n < 2 || m < 2 {
        return None;
    }

    let scale = (m - 1) as f64 / (n - 1) as f64;
    let points = health
        .iter()
        .enumerate()
        .map(|(i, (at, temperature_c))| {
            let pos = i as f64 * scale;
            CorrelatedPoint {
                at: *at,
                temperature_c: *temperature_c,
                iops: sample_at(&perf_iops, pos).unwrap_or(0.0),
                latency_us: sample_at(&perf_lat, pos),
            }
        })
        .collect();

    Some(CorrelatedTimeline {
        workload: workload.to_string(),
        points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn series(values: &[Option<f64>]) -> SampleSeries {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let mut s = SampleSeries::new("x", "");
        for (i, v) in values.iter().enumerate() {
            let at = t0 + chrono::Duration::seconds(i as i64);
            match v {
                Some(v) => s.record(at, *v),
                None => s.record_fault(at, "gap"),
            }
        }
        s
    }

    #[test]
    fn short_inputs_are_omitted() {
        let two = series(&[Some(1.0), Some(2.0)]);
        for short in [series(&[]), series(&[Some(1.0)])] {
            assert!(correlate("w", &short, &two, &two).is_none());
            assert!(correlate("w", &two, &short, &short).is_none());
        }
    }

    #[test]
    fn resamples_onto_health_count() {
        let health = series(&[Some(40.0), Some(41.0), Some(42.0)]);
        let iops = series(&[Some(100.0), Some(200.0), Some(300.0), Some(400.0), Some(500.0)]);
        let lat = series(&[Some(10.0), Some(20.0), Some(30.0), Some(40.0), Some(50.0)]);
        let c = correlate("randread", &health, &iops, &lat).unwrap();
        let got: Vec<f64> = c.points.iter().map(|p| p.iops).collect();
        assert_eq!(got, vec![100.0, 300.0, 500.0]);
        assert_eq!(c.points[1].latency_us, Some(30.0));
        assert_eq!(c.points[2].temperature_c, 42.0);
    }

    #[test]
    fn upsamples_by_interpolation() {
        let health = series(&[Some(40.0), Some(40.0), Some(40.0), Some(40.0), Some(40.0)]);
        let iops = series(&[Some(100.0), Some(300.0)]);
        let lat = series(&[Some(8.0), None]);
        let c = correlate("w", &health, &iops, &lat).unwrap();
        let got: Vec<f64> = c.points.iter().map(|p| p.iops).collect();
        assert_eq!(got, vec![100.0, 150.0, 200.0, 250.0, 300.0]);
        assert_eq!(c.points[0].latency_us, Some(8.0));
        assert_eq!(c.points[1].latency_us, Some(8.0));
        assert_eq!(c.points[4].latency_us, None);
    }

    #[test]
    fn sentinels_are_not_points() {
        let health = series(&[Some(40.0), None, Some(42.0)]);
        let iops = series(&[Some(1.0), None, Some(3.0)]);
        let c = correlate("w", &health, &iops, &iops).unwrap();
        assert_eq!(c.points.len(), 2);
        assert_eq!(c.points[1].iops, 3.0);
    }

    #[test]
    fn correlation_is_idempotent() {
        let health = series(&[Some(40.0), Some(45.0), Some(43.0)]);
        let iops = series(&[Some(10.0), Some(20.0), Some(15.0), Some(12.0)]);
        let a = correlate("w", &health, &iops, &iops);
        let b = correlate("w", &health, &iops, &iops);
        assert_eq!(a, b);
    }
}
