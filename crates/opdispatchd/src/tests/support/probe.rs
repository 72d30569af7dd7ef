use std::collections::VecDeque;

use crate::worker::{MemoryProbe, MemoryProbeError};

/// Returns scripted readings in order, then repeats the last one.
#[derive(Debug, Clone)]
pub(crate) struct ScriptedProbe {
    readings: VecDeque<u64>,
    last: u64,
}

impl ScriptedProbe {
    pub(crate) fn new(readings: impl IntoIterator<Item = u64>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
            last: 0,
        }
    }
}

impl MemoryProbe for ScriptedProbe {
    fn resident_bytes(&mut self) -> Result<u64, MemoryProbeError> {
        if let Some(reading) = self.readings.pop_front() {
            self.last = reading;
        }
        Ok(self.last)
    }
}
