//! Time series primitives shared by every sampler.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Select, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub at: DateTime<Utc>,
    pub value: Option<f64>,
    /// Set on sentinel samples: the interval produced no reading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl Sample {
    pub fn is_sentinel(&self) -> bool {
        self.value.is_none()
    }
}

/// Append-only series for one metric with non-decreasing timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSeries {
    pub metric: String,
    pub unit: String,
    pub samples: Vec<Sample>,
}

impl SampleSeries {
    pub fn new(metric: impl Into<String>, unit: impl Into<String>) -> Self {
        SampleSeries {
            metric: metric.into(),
            unit: unit.into(),
            samples: Vec::new(),
        }
    }

    /// Append, clamping a timestamp that would go backwards to the last one.
    pub fn push(&mut self, mut sample: Sample) {
        if let Some(last) = self.samples.last() {
            if sample.at < last.at {
                sample.at = last.at;
            }
        }
        self.samples.push(sample);
    }

    pub fn record(&mut self, at: DateTime<Utc>, value: f64) {
        self.push(Sample {
            at,
            value: Some(value),
            fault: None,
        });
    }

    pub fn record_fault(&mut self, at: DateTime<Utc>, fault: impl Into<String>) {
        self.push(Sample {
            at,
            value: None,
            fault: Some(fault.into()),
        });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Real readings only, sentinels skipped.
    pub fn readings(&self) -> impl Iterator<Item = (DateTime<Utc>, f64)> + '_ {
        self.samples.iter().filter_map(|s| s.value.map(|v| (s.at, v)))
    }

    pub fn values(&self) -> Vec<f64> {
        self.readings().map(|(_, v)| v).collect()
    }

    pub fn max(&self) -> Option<f64> {
        self.readings().map(|(_, v)| v).reduce(f64::max)
    }

    pub fn mean(&self) -> Option<f64> {
        let v = self.values();
        if v.is_empty() {
            None
        } else {
            Some(v.iter().sum::<f64>() / v.len() as f64)
        }
    }
}

/// Broadcast stop flag. Stopping drops the only sender, so every receiver
/// (in this signal and all of its children) observes a disconnect.
#[derive(Clone)]
pub struct StopSignal {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    watch: Vec<Receiver<()>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        StopSignal {
            trigger: Arc::new(Mutex::new(Some(tx))),
            watch: vec![rx],
        }
    }

    /// A signal that stops with its parent but can also be stopped alone.
    pub fn child(&self) -> Self {
        let (tx, rx) = bounded(0);
        let mut watch = self.watch.clone();
        watch.push(rx);
        StopSignal {
            trigger: Arc::new(Mutex::new(Some(tx))),
            watch,
        }
    }

    pub fn stop(&self) {
        self.trigger.lock().take();
    }

    pub fn is_stopped(&self) -> bool {
        self.watch
            .iter()
            .any(|rx| matches!(rx.try_recv(), Err(TryRecvError::Disconnected)))
    }

    /// Sleep up to `timeout`; returns `true` as soon as the signal fires.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let mut sel = Select::new();
        for rx in &self.watch {
            sel.recv(rx);
        }
        // Nothing is ever sent, so "ready" can only mean disconnected.
        sel.ready_timeout(timeout).is_ok()
    }
}

impl fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSignal")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        StopSignal::new()
    }
}

/// Sampling cadence: one reading at `0, interval, 2·interval, …` while the
/// offset is below `duration`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    pub duration: Duration,
    pub interval: Duration,
}

impl Pacing {
    pub fn new(duration: Duration, interval: Duration) -> Self {
        Pacing { duration, interval }
    }

    pub fn expected_samples(&self) -> usize {
        if self.interval.is_zero() {
            return usize::from(!self.duration.is_zero());
        }
        (self.duration.as_secs_f64() / self.interval.as_secs_f64()).ceil() as usize
    }
}

/// Drive `take` on the `pacing` schedule until the window closes, `take`
/// breaks, or `stop` fires. Slots missed because a reading ran long are
/// skipped rather than fired back to back.
pub fn sample_loop<F>(pacing: Pacing, stop: &StopSignal, mut take: F) -> usize
where
    F: FnMut() -> ControlFlow<()>,
{
    if pacing.interval.is_zero() {
        if pacing.duration.is_zero() || stop.is_stopped() {
            return 0;
        }
        let _ = take();
        return 1;
    }

    let start = Instant::now();
    let mut slot: u32 = 0;
    let mut taken = 0;
    loop {
        let offset = pacing.interval * slot;
        if offset >= pacing.duration {
            break;
        }
        let due = start + offset;
        let now = Instant::now();
        let stopped = if due > now {
            stop.wait(due - now)
        } else {
            stop.is_stopped()
        };
        if stopped {
            break;
        }
        taken += 1;
        if take().is_break() {
            break;
        }
        let elapsed_slots =
            (start.elapsed().as_secs_f64() / pacing.interval.as_secs_f64()).ceil() as u32;
        slot = (slot + 1).max(elapsed_slots);
    }
    taken
}
