//! System information probe backing `GET /system-info`.

use std::sync::OnceLock;

use serde::Serialize;
use sysinfo::System;

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub os: String,
    pub os_version: String,
    pub arch: String,
    pub cpu: String,
    pub physical_cores: usize,
    pub logical_cores: usize,
    pub memory_total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<VerboseInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerboseInfo {
    pub memory_available_bytes: u64,
    pub hostname: String,
    pub cpus: Vec<CpuInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuInfo {
    pub name: String,
    pub frequency_mhz: u64,
}

static BASE_INFO: OnceLock<SystemInfo> = OnceLock::new();

/// Hardware facts do not change while the server runs, so the non-verbose
/// probe is computed once.  The verbose view re-reads memory availability.
pub fn system_info(verbose: bool) -> SystemInfo {
    let base = BASE_INFO.get_or_init(probe).clone();
    if !verbose {
        return base;
    }

    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_all();
    let cpus = sys
        .cpus()
        .iter()
        .map(|cpu| CpuInfo {
            name: cpu.name().to_string(),
            frequency_mhz: cpu.frequency(),
        })
        .collect();

    SystemInfo {
        verbose: Some(VerboseInfo {
            memory_available_bytes: sys.available_memory(),
            hostname: System::host_name().unwrap_or_default(),
            cpus,
        }),
        ..base
    }
}

fn probe() -> SystemInfo {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_all();

    let cpu = sys
        .cpus()
        .first()
        .map(|c| c.brand().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    SystemInfo {
        os: System::name().unwrap_or_else(|| "unknown".to_string()),
        os_version: System::os_version().unwrap_or_default(),
        arch: System::cpu_arch().unwrap_or_default(),
        cpu,
        physical_cores: sys.physical_core_count().unwrap_or(0),
        logical_cores: sys.cpus().len(),
        memory_total_bytes: sys.total_memory(),
        verbose: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reports_cores_and_memory() {
        let info = system_info(false);
        assert!(info.logical_cores > 0);
        assert!(info.memory_total_bytes > 0);
        assert!(info.verbose.is_none());
    }

    #[test]
    fn verbose_adds_detail() {
        let info = system_info(true);
        assert!(info.verbose.is_some());
    }
}
