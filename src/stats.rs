use std::sync::atomic::Ordering;

use log::warn;

use crate::registry::RaplSampler;
use crate::Platform;

/// Energy and power statistics for the last measured interval.
///
/// Every series holds one value per socket plus one machine-wide aggregate
/// slot at index [`socket_count`](RaplStats::socket_count). The aggregate is
/// the sum over the active sockets for the energy series and the arithmetic
/// mean for the duration (sockets are sampled concurrently, so a sum would
/// misrepresent wall-clock cost). Power is energy over duration, per slot.
///
/// Sockets that were never initialized (or were released) contribute zeros
/// and are excluded from the aggregate.
#[derive(Debug, Clone)]
pub struct RaplStats {
    sockets: usize,
    pub duration_s: Vec<f64>,
    pub energy_package: Vec<f64>,
    pub energy_pp0: Vec<f64>,
    /// Package minus PP0: everything on the socket that is not the cores.
    pub energy_rest: Vec<f64>,
    pub energy_dram: Vec<f64>,
    /// Package plus DRAM.
    pub energy_total: Vec<f64>,
    pub power_package: Vec<f64>,
    pub power_pp0: Vec<f64>,
    pub power_rest: Vec<f64>,
    pub power_dram: Vec<f64>,
    pub power_total: Vec<f64>,
    /// Set when a socket's counters wrapped during the interval (an "after"
    /// reading below its "before"). The deltas are still returned but must
    /// not be trusted. The aggregate slot is the disjunction.
    pub overflowed: Vec<bool>,
    /// How many sockets contributed to the aggregate slot.
    pub active_sockets: u32,
}

impl RaplStats {
    pub fn socket_count(&self) -> usize {
        self.sockets
    }

    /// Index of the machine-wide aggregate slot.
    pub fn aggregate(&self) -> usize {
        self.sockets
    }
}

impl<P: Platform> RaplSampler<P> {
    /// Computes per-socket and machine-wide deltas from the paired samples.
    ///
    /// Callers must have completed a start/stop pair on every active socket
    /// first; the power series are only meaningful where the corresponding
    /// duration is positive (they are NaN otherwise).
    pub fn compute_stats(&self) -> RaplStats {
        let n = self.slots.len();
        let tick_hz = self.platform.tick_rate_hz();
        let counts_dram = self.calibration().map(|c| c.counts_dram()).unwrap_or(false);

        let mut stats = RaplStats {
            sockets: n,
            duration_s: vec![0.0; n + 1],
            energy_package: vec![0.0; n + 1],
            energy_pp0: vec![0.0; n + 1],
            energy_rest: vec![0.0; n + 1],
            energy_dram: vec![0.0; n + 1],
            energy_total: vec![0.0; n + 1],
            power_package: vec![0.0; n + 1],
            power_pp0: vec![0.0; n + 1],
            power_rest: vec![0.0; n + 1],
            power_dram: vec![0.0; n + 1],
            power_total: vec![0.0; n + 1],
            overflowed: vec![false; n + 1],
            active_sockets: 0,
        };

        for (i, slot) in self.slots.iter().enumerate() {
            if !slot.initialized.load(Ordering::Acquire) {
                continue;
            }
            stats.active_sockets += 1;
            let sample = &slot.sample;

            let ticks = sample
                .stop_ticks
                .load(Ordering::Relaxed)
                .wrapping_sub(sample.start_ticks.load(Ordering::Relaxed));
            stats.duration_s[i] = ticks as f64 / tick_hz;

            stats.energy_package[i] = sample.package_after.load() - sample.package_before.load();
            stats.energy_pp0[i] = sample.pp0_after.load() - sample.pp0_before.load();
            stats.energy_rest[i] = stats.energy_package[i] - stats.energy_pp0[i];
            stats.energy_dram[i] = if counts_dram {
                sample.secondary_after.load() - sample.secondary_before.load()
            } else {
                0.0
            };

            if stats.energy_package[i] < 0.0 || stats.energy_pp0[i] < 0.0 || stats.energy_dram[i] < 0.0
            {
                warn!("socket {i}: energy counter wrapped during the measured interval");
                stats.overflowed[i] = true;
            }
        }

        // Aggregate slot: sum the energies, average the duration.
        for i in 0..n {
            stats.duration_s[n] += stats.duration_s[i];
            stats.energy_package[n] += stats.energy_package[i];
            stats.energy_pp0[n] += stats.energy_pp0[i];
            stats.energy_rest[n] += stats.energy_rest[i];
            stats.energy_dram[n] += stats.energy_dram[i];
            stats.overflowed[n] |= stats.overflowed[i];
        }
        if stats.active_sockets > 0 {
            stats.duration_s[n] /= stats.active_sockets as f64;
        }

        for i in 0..=n {
            stats.energy_total[i] = stats.energy_package[i] + stats.energy_dram[i];
        }

        for i in 0..=n {
            let duration = stats.duration_s[i];
            if duration > 0.0 {
                stats.power_package[i] = stats.energy_package[i] / duration;
                stats.power_pp0[i] = stats.energy_pp0[i] / duration;
                stats.power_rest[i] = stats.energy_rest[i] / duration;
                stats.power_dram[i] = stats.energy_dram[i] / duration;
                stats.power_total[i] = stats.energy_total[i] / duration;
            } else {
                stats.power_package[i] = f64::NAN;
                stats.power_pp0[i] = f64::NAN;
                stats.power_rest[i] = f64::NAN;
                stats.power_dram[i] = f64::NAN;
                stats.power_total[i] = f64::NAN;
            }
        }

        stats
    }
}
