//! Resident-memory sampling for ingestion guards

use std::sync::Mutex;
use sysinfo::System;

/// Probe for resident-memory utilization, in the range 0.0..=1.0
pub trait MemoryProbe: Send + Sync {
    fn utilization(&self) -> f32;
}

/// Probe backed by system memory statistics
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn utilization(&self) -> f32 {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f32 / total as f32
    }
}

/// Fixed-value probe for tests and dry runs
pub struct FixedMemoryProbe {
    value: std::sync::atomic::AtomicU32,
}

impl FixedMemoryProbe {
    pub fn new(utilization: f32) -> Self {
        Self {
            value: std::sync::atomic::AtomicU32::new(utilization.to_bits()),
        }
    }

    pub fn set(&self, utilization: f32) {
        self.value
            .store(utilization.to_bits(), std::sync::atomic::Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn utilization(&self) -> f32 {
        f32::from_bits(self.value.load(std::sync::atomic::Ordering::SeqCst))
    }
}
