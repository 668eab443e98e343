use log::info;

use crate::cpu::CpuModel;
use crate::msr::{self, MsrError, RegisterAccess};

/// Scaling factors for the raw RAPL counters, read once per measurement
/// session from `MSR_RAPL_POWER_UNIT`.
///
/// Each register field is an exponent `e`; the unit is `(1/2)^e`. Multiplying
/// a raw counter by the matching unit yields watts, joules or seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Units {
    pub power: f64,
    pub energy: f64,
    pub time: f64,
}

impl Units {
    pub fn from_raw(raw: u64) -> Units {
        Units {
            power: unit_of(raw & 0xf),
            energy: unit_of((raw >> 8) & 0x1f),
            time: unit_of((raw >> 16) & 0xf),
        }
    }
}

fn unit_of(exponent: u64) -> f64 {
    0.5f64.powi(exponent as i32)
}

/// Package power characteristics from `MSR_PKG_POWER_INFO`.
#[derive(Debug, Clone, Copy)]
pub struct PackagePowerInfo {
    pub thermal_spec_w: f64,
    pub minimum_w: f64,
    pub maximum_w: f64,
    pub max_time_window_s: f64,
}

impl PackagePowerInfo {
    fn from_raw(raw: u64, units: &Units) -> PackagePowerInfo {
        PackagePowerInfo {
            thermal_spec_w: units.power * (raw & 0x7fff) as f64,
            minimum_w: units.power * ((raw >> 16) & 0x7fff) as f64,
            maximum_w: units.power * ((raw >> 32) & 0x7fff) as f64,
            max_time_window_s: units.time * ((raw >> 48) & 0x7fff) as f64,
        }
    }
}

/// The two package power limits from `MSR_PKG_RAPL_POWER_LIMIT`, with their
/// time windows and the locked/enabled/clamped flag bits.
#[derive(Debug, Clone, Copy)]
pub struct PackagePowerLimits {
    pub raw: u64,
    pub limit1_w: f64,
    pub window1_s: f64,
    pub limit2_w: f64,
    pub window2_s: f64,
}

impl PackagePowerLimits {
    fn from_raw(raw: u64, units: &Units) -> PackagePowerLimits {
        PackagePowerLimits {
            raw,
            limit1_w: units.power * (raw & 0x7fff) as f64,
            window1_s: units.time * ((raw >> 17) & 0x7f) as f64,
            limit2_w: units.power * ((raw >> 32) & 0x7fff) as f64,
            window2_s: units.time * ((raw >> 49) & 0x7f) as f64,
        }
    }

    pub fn locked(&self) -> bool {
        self.raw >> 63 != 0
    }

    pub fn limit1_enabled(&self) -> bool {
        self.raw & (1 << 15) != 0
    }

    pub fn limit1_clamped(&self) -> bool {
        self.raw & (1 << 16) != 0
    }

    pub fn limit2_enabled(&self) -> bool {
        self.raw & (1 << 47) != 0
    }

    pub fn limit2_clamped(&self) -> bool {
        self.raw & (1 << 48) != 0
    }
}

/// Which optional energy plane this machine exposes. Client parts report the
/// integrated-GPU power plane, server parts report DRAM energy; never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryPlane {
    GpuPowerPlane,
    DramEnergy,
}

impl SecondaryPlane {
    pub fn for_model(model: CpuModel) -> SecondaryPlane {
        if model.is_server() {
            SecondaryPlane::DramEnergy
        } else {
            SecondaryPlane::GpuPowerPlane
        }
    }
}

/// Everything derived once from the first initialized socket's registers:
/// units, descriptive power info and the plane selection. Immutable afterward
/// and shared by every socket.
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    pub model: CpuModel,
    pub units: Units,
    pub power_info: PackagePowerInfo,
    pub power_limits: PackagePowerLimits,
    pub secondary: SecondaryPlane,
}

impl Calibration {
    pub fn counts_dram(&self) -> bool {
        self.secondary == SecondaryPlane::DramEnergy
    }
}

/// Reads the unit, power-info and power-limit registers of one socket.
pub fn calibrate<R: RegisterAccess>(reg: &R, model: CpuModel) -> Result<Calibration, MsrError> {
    let units = Units::from_raw(reg.read(msr::MSR_RAPL_POWER_UNIT)?);
    let power_info = PackagePowerInfo::from_raw(reg.read(msr::MSR_PKG_POWER_INFO)?, &units);
    let power_limits = PackagePowerLimits::from_raw(reg.read(msr::MSR_PKG_RAPL_POWER_LIMIT)?, &units);

    info!(
        "RAPL units: power={} W, energy={} J, time={} s",
        units.power, units.energy, units.time
    );

    Ok(Calibration {
        model,
        units,
        power_info,
        power_limits,
        secondary: SecondaryPlane::for_model(model),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_is_half_to_the_exponent() {
        assert_eq!(unit_of(0), 1.0);
        assert_eq!(unit_of(3), 0.125);
        assert_eq!(unit_of(16), 2f64.powi(-16));
    }

    #[test]
    fn units_from_raw_fields() {
        // power exponent 3, energy exponent 16, time exponent 10
        let raw = 0x3 | (16 << 8) | (10 << 16);
        let units = Units::from_raw(raw);
        assert_eq!(units.power, 0.125);
        assert_eq!(units.energy, 0.0000152587890625);
        assert_eq!(units.time, 0.0009765625);
    }

    #[test]
    fn power_info_fields() {
        let units = Units {
            power: 0.125,
            energy: 1.0,
            time: 0.5,
        };
        // thermal 800 (100 W), min 400, max 1600, window 8
        let raw = 800u64 | (400 << 16) | (1600 << 32) | (8 << 48);
        let info = PackagePowerInfo::from_raw(raw, &units);
        assert_eq!(info.thermal_spec_w, 100.0);
        assert_eq!(info.minimum_w, 50.0);
        assert_eq!(info.maximum_w, 200.0);
        assert_eq!(info.max_time_window_s, 4.0);
    }

    #[test]
    fn power_limit_flags() {
        let units = Units {
            power: 1.0,
            energy: 1.0,
            time: 1.0,
        };
        let raw = (1u64 << 63) | (1 << 15) | (1 << 47);
        let limits = PackagePowerLimits::from_raw(raw, &units);
        assert!(limits.locked());
        assert!(limits.limit1_enabled());
        assert!(!limits.limit1_clamped());
        assert!(limits.limit2_enabled());
        assert!(!limits.limit2_clamped());

        let clamped = PackagePowerLimits::from_raw((1 << 16) | (1 << 48), &units);
        assert!(!clamped.locked());
        assert!(clamped.limit1_clamped());
        assert!(clamped.limit2_clamped());
    }

    #[test]
    fn power_limit_values() {
        let units = Units {
            power: 0.125,
            energy: 1.0,
            time: 0.0009765625,
        };
        let raw = 1200u64 | (40 << 17) | (1440u64 << 32) | (80u64 << 49);
        let limits = PackagePowerLimits::from_raw(raw, &units);
        assert_eq!(limits.limit1_w, 150.0);
        assert_eq!(limits.window1_s, 40.0 * 0.0009765625);
        assert_eq!(limits.limit2_w, 180.0);
        assert_eq!(limits.window2_s, 80.0 * 0.0009765625);
    }

    #[test]
    fn secondary_plane_selection() {
        assert_eq!(
            SecondaryPlane::for_model(CpuModel::IvyBridgeEp),
            SecondaryPlane::DramEnergy
        );
        assert_eq!(
            SecondaryPlane::for_model(CpuModel::Haswell),
            SecondaryPlane::GpuPowerPlane
        );
    }
}
