use anyhow::{bail, Result};
use std::sync::atomic::{AtomicI64, Ordering};

/// Gauge of active persisted-client workers, fed by the processor.
pub trait ProcessorCounter: Send + Sync {
    fn increment(&self) -> Result<()>;
    fn decrement(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct AtomicProcessorCounter {
    value: AtomicI64,
}

impl AtomicProcessorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

impl ProcessorCounter for AtomicProcessorCounter {
    fn increment(&self) -> Result<()> {
        self.value.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn decrement(&self) -> Result<()> {
        let previous = self.value.fetch_sub(1, Ordering::SeqCst);
        if previous <= 0 {
            self.value.fetch_add(1, Ordering::SeqCst);
            bail!("processor counter would drop below zero");
        }
        Ok(())
    }
}
