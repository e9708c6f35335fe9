use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use sysinfo::System;

use super::{DataSource, Stat};

static SYSTEM: Lazy<Mutex<System>> = Lazy::new(|| Mutex::new(System::new()));

const POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";

/// Reads stats directly from the system.
#[derive(Debug, Clone)]
pub struct SystemStats {
    power_supply_dir: PathBuf,
}

impl Default for SystemStats {
    fn default() -> Self {
        SystemStats { power_supply_dir: PathBuf::from(POWER_SUPPLY_DIR) }
    }
}

impl SystemStats {
    pub fn with_power_supply_dir(dir: impl Into<PathBuf>) -> Self {
        SystemStats { power_supply_dir: dir.into() }
    }
}

impl DataSource for SystemStats {
    fn name(&self) -> &str {
        "system"
    }

    fn read(&self, stat: Stat) -> Result<String> {
        match stat {
            Stat::Battery => get_battery_capacity(&self.power_supply_dir).map(|capacity| capacity.to_string()),
            Stat::Cpu => Ok(format!("{:.1}", get_cpu_usage())),
            Stat::Memory => get_memory_usage().map(|usage| format!("{:.0}", usage)),
            Stat::Time => Ok(chrono::Local::now().format("%H:%M:%S").to_string()),
        }
    }
}

fn get_cpu_usage() -> f32 {
    let mut system = SYSTEM.lock().unwrap_or_else(PoisonError::into_inner);
    // usage is computed from the difference between two refreshes
    system.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    system.refresh_cpu_usage();
    system.global_cpu_usage()
}

fn get_memory_usage() -> Result<f64> {
    let mut system = SYSTEM.lock().unwrap_or_else(PoisonError::into_inner);
    system.refresh_memory();
    let total = system.total_memory();
    if total == 0 {
        bail!("Total memory is unknown");
    }
    Ok(total.saturating_sub(system.available_memory()) as f64 / total as f64 * 100f64)
}

/// Average capacity of all batteries, in percent.
fn get_battery_capacity(power_supply_dir: &Path) -> Result<i64> {
    let entries = power_supply_dir.read_dir().with_context(|| format!("Couldn't read {}", power_supply_dir.display()))?;
    let mut capacities = Vec::new();
    for entry in entries {
        let entry = entry?.path();
        let is_battery = read_to_string(entry.join("type")).map(|kind| kind.trim() == "Battery").unwrap_or(false);
        if !is_battery {
            continue;
        }
        if let Ok(capacity) = read_to_string(entry.join("capacity")) {
            let capacity = capacity.trim().parse::<f64>().with_context(|| format!("Invalid capacity in {}", entry.display()))?;
            capacities.push(capacity);
        }
    }
    if capacities.is_empty() {
        bail!("No battery found in {}", power_supply_dir.display());
    }
    Ok((capacities.iter().sum::<f64>() / capacities.len() as f64).round() as i64)
}
