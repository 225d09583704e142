use crate::diagnostics::{Counters, Diagnostics};
use crate::error::SensorError;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use shared::types::SensorReading;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Where environmental readings come from. On the deployed hardware this
/// is the I2C-attached sensor; elsewhere a synthetic walk stands in.
#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn read(&self) -> Result<SensorReading, SensorError>;
}

/// Latest local sensor picture, shown in the status API. A degraded
/// sensor never takes the node out of dispatch rotation.
#[derive(Debug, Clone, Default)]
pub struct SensorState {
    pub last_reading: Option<SensorReading>,
    pub degraded: bool,
    pub consecutive_failures: u32,
}

struct Walk {
    temperature: f64,
    humidity: f64,
    air_quality: f64,
}

/// Random-walk source for nodes without real hardware.
pub struct SyntheticSensor {
    walk: Mutex<Walk>,
}

impl SyntheticSensor {
    pub fn new() -> Self {
        Self {
            walk: Mutex::new(Walk {
                temperature: 21.0,
                humidity: 45.0,
                air_quality: 120.0,
            }),
        }
    }
}

impl Default for SyntheticSensor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SensorSource for SyntheticSensor {
    async fn read(&self) -> Result<SensorReading, SensorError> {
        let mut walk = self.walk.lock().await;
        {
            let mut rng = rand::rng();
            walk.temperature = (walk.temperature + rng.random_range(-0.4..0.4)).clamp(16.0, 30.0);
            walk.humidity = (walk.humidity + rng.random_range(-1.5..1.5)).clamp(25.0, 75.0);
            walk.air_quality = (walk.air_quality + rng.random_range(-4.0..4.0)).clamp(50.0, 300.0);
        }
        Ok(SensorReading {
            temperature: walk.temperature,
            humidity: walk.humidity,
            air_quality: walk.air_quality.round() as i32,
            timestamp: Utc::now(),
        })
    }
}

fn jittered(d: Duration) -> Duration {
    d.mul_f64(rand::rng().random_range(0.8..1.2))
}

/// Polls the source at `poll_interval`. Read failures mark the state
/// degraded and stretch the retry gap exponentially up to `backoff_cap`;
/// the first successful read snaps everything back to normal.
pub async fn run_sensor_loop(
    source: Arc<dyn SensorSource>,
    state: Arc<RwLock<SensorState>>,
    diagnostics: Arc<Diagnostics>,
    poll_interval: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
) {
    let mut backoff = backoff_base;
    loop {
        match source.read().await {
            Ok(reading) => {
                let was_degraded = {
                    let mut s = state.write().await;
                    let was = s.degraded;
                    s.last_reading = Some(reading);
                    s.degraded = false;
                    s.consecutive_failures = 0;
                    was
                };
                if was_degraded {
                    info!("sensor recovered");
                    diagnostics.event("sensor recovered").await;
                }
                backoff = backoff_base;
                tokio::time::sleep(poll_interval).await;
            }
            Err(e) => {
                let failures = {
                    let mut s = state.write().await;
                    s.degraded = true;
                    s.consecutive_failures += 1;
                    s.consecutive_failures
                };
                Counters::bump(&diagnostics.counters.sensor_failures);
                warn!(failures, error = %e, "sensor read failed");
                if failures == 1 {
                    diagnostics.event(format!("sensor degraded: {e}")).await;
                }
                tokio::time::sleep(jittered(backoff)).await;
                backoff = (backoff * 2).min(backoff_cap);
            }
        }
    }
}
