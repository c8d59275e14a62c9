use crate::types::Sample;
use chrono::Utc;

/// Stand-in for a cumulative energy meter: every reading is the previous one
/// plus a random consumption increment.
#[derive(Debug, Clone)]
pub struct MeterSimulator {
    counter: f64,
}

impl MeterSimulator {
    pub fn new(start: f64) -> Self {
        Self { counter: start }
    }

    pub fn next_reading(&mut self) -> Sample {
        // 0.5 to 2.5 Wh per tick
        self.counter += 0.5 + rand::random::<f64>() * 2.0;
        Sample::new(Utc::now(), self.counter.floor())
    }
}

impl Default for MeterSimulator {
    fn default() -> Self {
        Self::new(1000.0)
    }
}
