use shared::types::LoadEstimate;
use sysinfo::System;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
#[error("load sample failed: {0}")]
pub struct SampleError(pub String);

/// Source of raw CPU utilization numbers, 0-100. Implementations may
/// fail transiently; the reporter tolerates a configured number of
/// misses before declaring its estimate unusable.
pub trait LoadSampler: Send {
    fn sample(&mut self) -> Result<f64, SampleError>;
}

/// Real sampler backed by the OS counters.
pub struct SysinfoSampler {
    sys: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SysinfoSampler {
    fn sample(&mut self) -> Result<f64, SampleError> {
        self.sys.refresh_cpu_usage();
        Ok(self.sys.global_cpu_info().cpu_usage() as f64)
    }
}

/// Constant sampler for tests and demos.
pub struct FixedSampler(pub f64);

impl LoadSampler for FixedSampler {
    fn sample(&mut self) -> Result<f64, SampleError> {
        Ok(self.0)
    }
}

/// Smooths raw samples with an exponential moving average and tracks
/// sample freshness. After enough consecutive failed samples the
/// estimate turns Unknown rather than advertising a stale number.
pub struct LoadReporter {
    ema: Option<f64>,
    weight: f64,
    consecutive_failures: u32,
    max_stale: u32,
}

impl LoadReporter {
    pub fn new(weight: f64, max_stale: u32) -> Self {
        Self {
            ema: None,
            weight,
            consecutive_failures: 0,
            max_stale,
        }
    }

    pub fn record_sample(&mut self, sample: Result<f64, SampleError>) {
        match sample {
            Ok(raw) => {
                let raw = raw.clamp(0.0, 100.0);
                self.ema = Some(match self.ema {
                    Some(prev) => self.weight * raw + (1.0 - self.weight) * prev,
                    None => raw,
                });
                self.consecutive_failures = 0;
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                debug!(failures = self.consecutive_failures, error = %e, "load sample failed");
            }
        }
    }

    pub fn current_load(&self) -> LoadEstimate {
        match self.ema {
            Some(v) if self.consecutive_failures < self.max_stale => {
                LoadEstimate::Known(v.round() as u8)
            }
            _ => LoadEstimate::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail() -> Result<f64, SampleError> {
        Err(SampleError("proc returned garbage".into()))
    }

    #[test]
    fn first_sample_seeds_the_average() {
        let mut r = LoadReporter::new(0.3, 3);
        assert_eq!(r.current_load(), LoadEstimate::Unknown);

        r.record_sample(Ok(60.0));
        assert_eq!(r.current_load(), LoadEstimate::Known(60));
    }

    #[test]
    fn smoothing_dampens_spikes() {
        let mut r = LoadReporter::new(0.3, 3);
        r.record_sample(Ok(10.0));
        r.record_sample(Ok(100.0));

        // 0.3 * 100 + 0.7 * 10 = 37
        assert_eq!(r.current_load(), LoadEstimate::Known(37));
    }

    #[test]
    fn estimate_goes_unknown_after_stale_window() {
        let mut r = LoadReporter::new(0.3, 3);
        r.record_sample(Ok(50.0));

        r.record_sample(fail());
        r.record_sample(fail());
        assert_eq!(r.current_load(), LoadEstimate::Known(50));

        r.record_sample(fail());
        assert_eq!(r.current_load(), LoadEstimate::Unknown);
    }

    #[test]
    fn fresh_sample_recovers_from_unknown() {
        let mut r = LoadReporter::new(0.3, 3);
        r.record_sample(Ok(40.0));
        for _ in 0..5 {
            r.record_sample(fail());
        }
        assert_eq!(r.current_load(), LoadEstimate::Unknown);

        r.record_sample(Ok(80.0));
        // 0.3 * 80 + 0.7 * 40 = 52
        assert_eq!(r.current_load(), LoadEstimate::Known(52));
    }

    #[test]
    fn out_of_range_samples_are_clamped() {
        let mut r = LoadReporter::new(1.0, 3);
        r.record_sample(Ok(250.0));
        assert_eq!(r.current_load(), LoadEstimate::Known(100));

        r.record_sample(Ok(-5.0));
        assert_eq!(r.current_load(), LoadEstimate::Known(0));
    }
}
