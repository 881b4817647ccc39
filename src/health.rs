// src/health.rs
//
// System metric sampling for edge:health reports. CPU usage is measured
// between successive collects, so the first report after startup reads low.

use sysinfo::{Components, System};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHealth {
    /// Percent, 0-100
    pub cpu_usage: f32,
    /// Percent of total memory in use, 0-100
    pub memory_usage: f32,
    /// No portable source; reported as 0
    pub gpu_usage: f32,
    /// Celsius, hottest component; 0 when unavailable
    pub temperature: f32,
}

pub struct HealthCollector {
    sys: System,
}

impl HealthCollector {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    pub fn collect(&mut self) -> SystemHealth {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let cpu_usage = self.sys.global_cpu_usage();
        let total = self.sys.total_memory();
        let memory_usage = if total > 0 {
            (self.sys.used_memory() as f64 / total as f64 * 100.0) as f32
        } else {
            0.0
        };

        // Components without a reading report None and are skipped
        let components = Components::new_with_refreshed_list();
        let temperature = components
            .iter()
            .filter_map(|c| c.temperature())
            .fold(0.0f32, f32::max);

        let health = SystemHealth {
            cpu_usage,
            memory_usage,
            gpu_usage: 0.0,
            temperature,
        };
        debug!(
            "system health: cpu={:.1}% mem={:.1}% temp={:.1}C",
            health.cpu_usage, health.memory_usage, health.temperature
        );
        health
    }
}

impl Default for HealthCollector {
    fn default() -> Self {
        Self::new()
    }
}
