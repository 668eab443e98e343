use std::fs;
use std::sync::OnceLock;

use regex::Regex;

use crate::RaplError;

/// The Intel microarchitectures with known RAPL register layouts.
///
/// The numeric values are the `model` field of `/proc/cpuinfo` (family 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuModel {
    SandyBridge,
    SandyBridgeEp,
    IvyBridge,
    IvyBridgeEp,
    Haswell,
}

impl CpuModel {
    pub fn from_model_number(model: u32) -> Option<CpuModel> {
        match model {
            42 => Some(CpuModel::SandyBridge),
            45 => Some(CpuModel::SandyBridgeEp),
            58 => Some(CpuModel::IvyBridge),
            62 => Some(CpuModel::IvyBridgeEp),
            60 => Some(CpuModel::Haswell),
            _ => None,
        }
    }

    /// Server-class (-EP) parts count DRAM energy and expose the package/PP0
    /// perf-status (throttled time) registers; client parts expose PP1 instead.
    pub fn is_server(self) -> bool {
        matches!(self, CpuModel::SandyBridgeEp | CpuModel::IvyBridgeEp)
    }
}

/// Identifies the CPU from `/proc/cpuinfo`.
pub fn detect_cpu_model() -> Result<CpuModel, RaplError> {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo")
        .map_err(|e| RaplError::UnsupportedCpu(format!("cannot read /proc/cpuinfo: {e}")))?;
    parse_cpuinfo(&cpuinfo)
}

fn cpuinfo_field<'a>(cpuinfo: &'a str, field: &str) -> Option<&'a str> {
    static LINE: OnceLock<Regex> = OnceLock::new();
    let re = LINE.get_or_init(|| Regex::new(r"(?m)^([^:\n\t]+?)\s*:\s*(.*)$").unwrap());
    re.captures_iter(cpuinfo)
        .find(|c| &c[1] == field)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str().trim())
}

pub(crate) fn parse_cpuinfo(cpuinfo: &str) -> Result<CpuModel, RaplError> {
    let vendor = cpuinfo_field(cpuinfo, "vendor_id").unwrap_or("unknown");
    if vendor != "GenuineIntel" {
        return Err(RaplError::UnsupportedCpu(format!("{vendor} is not an Intel chip")));
    }

    let family: u32 = cpuinfo_field(cpuinfo, "cpu family")
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| RaplError::UnsupportedCpu("missing cpu family".into()))?;
    if family != 6 {
        return Err(RaplError::UnsupportedCpu(format!("wrong CPU family {family}")));
    }

    let model: u32 = cpuinfo_field(cpuinfo, "model")
        .and_then(|m| m.parse().ok())
        .ok_or_else(|| RaplError::UnsupportedCpu("missing model number".into()))?;

    CpuModel::from_model_number(model)
        .ok_or_else(|| RaplError::UnsupportedCpu(format!("unsupported model {model}")))
}
