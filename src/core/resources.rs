//! Host resource sampling and admission verdicts.

use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::Mutex;
use tracing::warn;

use crate::core::config::{ConfigHandle, MaxConcurrent};

const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
const MAX_CONCURRENT_CAP: u32 = 20;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub memory_percent: f32,
    pub available_memory_mb: f64,
    pub running_processes: usize,
}

/// Samples CPU, memory and CLI process count. A pure sensor: it never
/// mutates supervisor state.
pub struct ResourceMonitor {
    config: ConfigHandle,
    system: Mutex<System>,
}

impl ResourceMonitor {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            system: Mutex::new(System::new_all()),
        }
    }

    pub async fn current_usage(&self) -> ResourceUsage {
        let cli_name = self.config.get().loop_cfg.cli_command.to_lowercase();
        let mut sys = self.system.lock().await;

        sys.refresh_cpu_all();
        tokio::time::sleep(CPU_SAMPLE_INTERVAL).await;
        sys.refresh_cpu_all();
        sys.refresh_memory();
        sys.refresh_processes(ProcessesToUpdate::All);

        let total = sys.total_memory() as f64;
        let used = sys.used_memory() as f64;
        let available = sys.available_memory() as f64;

        let running_processes = sys
            .processes()
            .values()
            .filter(|process| {
                process
                    .cmd()
                    .iter()
                    .any(|arg| arg.to_string_lossy().to_lowercase().contains(&cli_name))
            })
            .count();

        ResourceUsage {
            cpu_percent: sys.global_cpu_usage(),
            memory_mb: used / (1024.0 * 1024.0),
            memory_percent: if total > 0.0 {
                (used / total * 100.0) as f32
            } else {
                0.0
            },
            available_memory_mb: available / (1024.0 * 1024.0),
            running_processes,
        }
    }

    /// Admission verdict: false when CPU is at the high threshold or there is
    /// not one agent's worth of memory left.
    pub async fn can_run_agent(&self) -> bool {
        let system = self.config.get().system;
        let usage = self.current_usage().await;

        if usage.cpu_percent >= system.cpu_threshold_high {
            warn!("CPU too high: {:.1}%", usage.cpu_percent);
            return false;
        }
        if usage.available_memory_mb < system.memory_limit_per_agent_mb as f64 {
            warn!(
                "Memory too low: {:.0}MB available",
                usage.available_memory_mb
            );
            return false;
        }
        true
    }

    pub async fn should_throttle(&self) -> bool {
        let low = self.config.get().system.cpu_threshold_low;
        self.current_usage().await.cpu_percent >= low
    }

    pub async fn max_concurrent_agents(&self) -> u32 {
        let system = self.config.get().system;
        match system.max_concurrent_agents {
            MaxConcurrent::Fixed(n) => n,
            MaxConcurrent::Auto(_) => {
                let (available_mb, cpu_count) = {
                    let mut sys = self.system.lock().await;
                    sys.refresh_memory();
                    let cpus = sys.cpus().len();
                    (
                        sys.available_memory() as f64 / (1024.0 * 1024.0),
                        if cpus > 0 { cpus } else { 4 },
                    )
                };
                auto_max_concurrent(available_mb, system.memory_limit_per_agent_mb, cpu_count)
            }
        }
    }
}

/// `min(available/per_agent × 0.7, 2 × cpus, 20)` — the auto ceiling.
fn auto_max_concurrent(available_mb: f64, per_agent_mb: u64, cpu_count: usize) -> u32 {
    let memory_based = (available_mb / per_agent_mb as f64 * 0.7) as u32;
    let cpu_based = (cpu_count * 2) as u32;
    memory_based.min(cpu_based).min(MAX_CONCURRENT_CAP)
}

/// Caches the monitor's recommended ceiling for display. Actual admission is
/// decided live per launch, never against this number.
pub struct ConcurrencyController {
    cached_max: Mutex<Option<(u32, Instant)>>,
    ttl: Duration,
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ConcurrencyController {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cached_max: Mutex::new(None),
            ttl,
        }
    }

    pub async fn max_concurrent(&self, monitor: &ResourceMonitor, force_recalc: bool) -> u32 {
        let mut cached = self.cached_max.lock().await;
        if !force_recalc
            && let Some((value, refreshed)) = *cached
            && refreshed.elapsed() < self.ttl
        {
            return value;
        }
        let fresh = monitor.max_concurrent_agents().await.max(1);
        *cached = Some((fresh, Instant::now()));
        fresh
    }
}
