use std::fmt;

use crate::stats::RaplStats;
use crate::units::Calibration;

/// How much detail a [`StatsReport`] renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReportDetail {
    /// Durations, consumed energies and powers.
    Energy,
    /// Everything above plus the calibrated units, package power info and
    /// power limits.
    Full,
}

/// Renders a [`RaplStats`] as an aligned table: one "Total" column followed
/// by one column per socket.
pub struct StatsReport<'a> {
    stats: &'a RaplStats,
    calibration: Option<&'a Calibration>,
    detail: ReportDetail,
}

impl RaplStats {
    pub fn report(&self, detail: ReportDetail) -> StatsReport<'_> {
        StatsReport {
            stats: self,
            calibration: None,
            detail,
        }
    }
}

impl<'a> StatsReport<'a> {
    /// Adds the calibration block rendered by the `Full` detail level.
    pub fn with_calibration(mut self, calibration: &'a Calibration) -> StatsReport<'a> {
        self.calibration = Some(calibration);
        self
    }
}

/// Writes one table row: aggregate first, then every socket.
fn row(f: &mut fmt::Formatter<'_>, label: &str, values: &[f64], unit: &str) -> fmt::Result {
    let Some((aggregate, sockets)) = values.split_last() else {
        return Ok(());
    };
    write!(f, "{label:<26}: {aggregate:11.6} ")?;
    for value in sockets {
        write!(f, "{value:11.6} ")?;
    }
    writeln!(f, "{unit}")
}

impl fmt::Display for StatsReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats;
        let n = stats.socket_count();

        for socket in 0..n {
            if stats.overflowed[socket] {
                writeln!(f, "WARNING: socket {socket} measurements might have overflown")?;
            }
        }

        write!(f, "{:<26}: {:<11} ", "", "Total")?;
        for socket in 0..n {
            write!(f, "Socket {socket:<4} ")?;
        }
        writeln!(f)?;

        if self.detail >= ReportDetail::Full {
            if let Some(calibration) = self.calibration {
                write!(f, "{}", CalibrationReport(calibration))?;
            }
        }

        let counts_dram = self.calibration.map(|c| c.counts_dram()).unwrap_or(false);

        row(f, "Duration", &stats.duration_s, "s")?;
        row(f, "Total energy", &stats.energy_total, "J")?;
        row(f, "Package energy", &stats.energy_package, "J")?;
        row(f, "PowerPlane0 energy", &stats.energy_pp0, "J")?;
        if counts_dram {
            row(f, "DRAM energy", &stats.energy_dram, "J")?;
        }
        row(f, "Rest energy", &stats.energy_rest, "J")?;

        row(f, "Total power", &stats.power_total, "W")?;
        row(f, "Package power", &stats.power_package, "W")?;
        row(f, "PowerPlane0 power", &stats.power_pp0, "W")?;
        if counts_dram {
            row(f, "DRAM power", &stats.power_dram, "W")?;
        }
        row(f, "Rest power", &stats.power_rest, "W")
    }
}

/// Renders the one-time calibration values: units, package power info and
/// the package power limits with their flag bits.
pub struct CalibrationReport<'a>(pub &'a Calibration);

impl fmt::Display for CalibrationReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let calibration = self.0;
        let units = calibration.units;
        let info = calibration.power_info;
        let limits = calibration.power_limits;

        writeln!(f, "{:<26}: {:.3} W", "Power units", units.power)?;
        writeln!(f, "{:<26}: {:.8} J", "Energy units", units.energy)?;
        writeln!(f, "{:<26}: {:.8} s", "Time units", units.time)?;
        writeln!(f, "{:<26}: {:.3} W", "Package thermal spec", info.thermal_spec_w)?;
        writeln!(f, "{:<26}: {:.3} W", "Package minimum power", info.minimum_w)?;
        writeln!(f, "{:<26}: {:.3} W", "Package maximum power", info.maximum_w)?;
        writeln!(
            f,
            "{:<26}: {:.6} s",
            "Package max time window", info.max_time_window_s
        )?;
        writeln!(
            f,
            "{:<26}: {}",
            "Package power limits",
            if limits.locked() { "locked" } else { "unlocked" }
        )?;
        writeln!(
            f,
            "{:<26}: {:.3} W for {:.6} s ({}, {})",
            "Power limit #1",
            limits.limit1_w,
            limits.window1_s,
            if limits.limit1_enabled() { "enabled" } else { "disabled" },
            if limits.limit1_clamped() { "clamped" } else { "not clamped" }
        )?;
        writeln!(
            f,
            "{:<26}: {:.3} W for {:.6} s ({}, {})",
            "Power limit #2",
            limits.limit2_w,
            limits.window2_s,
            if limits.limit2_enabled() { "enabled" } else { "disabled" },
            if limits.limit2_clamped() { "clamped" } else { "not clamped" }
        )
    }
}
