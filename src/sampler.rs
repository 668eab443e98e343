use std::sync::atomic::Ordering;

use crate::msr::{self, Addr, RegisterAccess};
use crate::registry::{ControllerToken, OwnerToken, RaplSampler, SamplePair};
use crate::units::{Calibration, SecondaryPlane};
use crate::{Platform, RaplError};

// The protected operations are gated on the calling thread owning its socket,
// so every participating thread can call them symmetrically; only the elected
// owner actually reads the registers. The fast variants keep the hot path
// small: raw counts at start, one multiplication per value at stop.

impl<P: Platform> RaplSampler<P> {
    /// Full "before" reading of the calling thread's socket: package and PP0
    /// energy, power-plane policies, the model-dependent secondary plane and,
    /// on server models, the accumulated throttled times. Values are scaled
    /// at read time. No-op unless the thread owns its socket.
    pub fn start(&self) -> Result<(), RaplError> {
        if !self.is_active() {
            return Ok(());
        }
        let Some(socket) = self.current_socket() else {
            return Ok(());
        };
        self.start_full(socket)
    }

    /// Mirror of [`start`](RaplSampler::start), filling the "after" half and
    /// the stop timestamp.
    pub fn stop(&self) -> Result<(), RaplError> {
        if !self.is_active() {
            return Ok(());
        }
        let Some(socket) = self.current_socket() else {
            return Ok(());
        };
        self.stop_full(socket)
    }

    /// Minimal "before" reading (package, PP0 and, when the machine counts
    /// DRAM, the DRAM plane). Stores raw counts; the unit is applied for both
    /// halves at stop. No-op unless the thread owns its socket.
    pub fn start_fast(&self) -> Result<(), RaplError> {
        if !self.is_active() {
            return Ok(());
        }
        let Some(socket) = self.current_socket() else {
            return Ok(());
        };
        self.start_fast_socket(socket)
    }

    /// Mirror of [`start_fast`](RaplSampler::start_fast); applies the
    /// deferred unit scaling to both halves of the pair.
    pub fn stop_fast(&self) -> Result<(), RaplError> {
        if !self.is_active() {
            return Ok(());
        }
        let Some(socket) = self.current_socket() else {
            return Ok(());
        };
        self.stop_fast_socket(socket)
    }

    fn read_reg(&self, reg: &P::Msr, offset: Addr, socket: u32) -> Result<u64, RaplError> {
        reg.read(offset)
            .map_err(|source| RaplError::SamplingIo { socket, source })
    }

    fn socket_reader(&self, socket: u32) -> Option<(&SamplePair, &P::Msr, &Calibration)> {
        let slot = self.slots.get(socket as usize)?;
        let msr = slot.msr.get()?;
        let calibration = self.calibration()?;
        Some((&slot.sample, msr, calibration))
    }

    fn start_full(&self, socket: u32) -> Result<(), RaplError> {
        let Some((sample, msr, cal)) = self.socket_reader(socket) else {
            return Ok(());
        };
        let units = cal.units;

        let raw = self.read_reg(msr, msr::MSR_PKG_ENERGY_STATUS, socket)?;
        sample.package_before.store(raw as f64 * units.energy);

        if cal.model.is_server() {
            let raw = self.read_reg(msr, msr::MSR_PKG_PERF_STATUS, socket)?;
            self.pkg_throttled_s.store(raw as f64 * units.time);
        }

        let raw = self.read_reg(msr, msr::MSR_PP0_ENERGY_STATUS, socket)?;
        sample.pp0_before.store(raw as f64 * units.energy);

        let raw = self.read_reg(msr, msr::MSR_PP0_POLICY, socket)?;
        self.pp0_policy.store(raw as u32 & 0x1f, Ordering::Relaxed);

        if cal.model.is_server() {
            let raw = self.read_reg(msr, msr::MSR_PP0_PERF_STATUS, socket)?;
            self.pp0_throttled_s.store(raw as f64 * units.time);
        }

        match cal.secondary {
            SecondaryPlane::GpuPowerPlane => {
                let raw = self.read_reg(msr, msr::MSR_PP1_ENERGY_STATUS, socket)?;
                sample.secondary_before.store(raw as f64 * units.energy);
                let raw = self.read_reg(msr, msr::MSR_PP1_POLICY, socket)?;
                self.pp1_policy.store(raw as u32 & 0x1f, Ordering::Relaxed);
            }
            SecondaryPlane::DramEnergy => {
                let raw = self.read_reg(msr, msr::MSR_DRAM_ENERGY_STATUS, socket)?;
                sample.secondary_before.store(raw as f64 * units.energy);
            }
        }

        sample
            .start_ticks
            .store(self.platform.ticks(), Ordering::Relaxed);
        Ok(())
    }

    fn stop_full(&self, socket: u32) -> Result<(), RaplError> {
        let Some((sample, msr, cal)) = self.socket_reader(socket) else {
            return Ok(());
        };
        let units = cal.units;

        sample
            .stop_ticks
            .store(self.platform.ticks(), Ordering::Relaxed);

        let raw = self.read_reg(msr, msr::MSR_PKG_ENERGY_STATUS, socket)?;
        sample.package_after.store(raw as f64 * units.energy);

        let raw = self.read_reg(msr, msr::MSR_PP0_ENERGY_STATUS, socket)?;
        sample.pp0_after.store(raw as f64 * units.energy);

        let offset = match cal.secondary {
            SecondaryPlane::GpuPowerPlane => msr::MSR_PP1_ENERGY_STATUS,
            SecondaryPlane::DramEnergy => msr::MSR_DRAM_ENERGY_STATUS,
        };
        let raw = self.read_reg(msr, offset, socket)?;
        sample.secondary_after.store(raw as f64 * units.energy);
        Ok(())
    }

    pub(crate) fn start_fast_socket(&self, socket: u32) -> Result<(), RaplError> {
        let Some((sample, msr, cal)) = self.socket_reader(socket) else {
            return Ok(());
        };

        sample
            .start_ticks
            .store(self.platform.ticks(), Ordering::Relaxed);

        if cal.counts_dram() {
            let raw = self.read_reg(msr, msr::MSR_DRAM_ENERGY_STATUS, socket)?;
            sample.secondary_before.store(raw as f64);
        }
        let raw = self.read_reg(msr, msr::MSR_PKG_ENERGY_STATUS, socket)?;
        sample.package_before.store(raw as f64);
        let raw = self.read_reg(msr, msr::MSR_PP0_ENERGY_STATUS, socket)?;
        sample.pp0_before.store(raw as f64);
        Ok(())
    }

    pub(crate) fn stop_fast_socket(&self, socket: u32) -> Result<(), RaplError> {
        let Some((sample, msr, cal)) = self.socket_reader(socket) else {
            return Ok(());
        };

        let raw = self.read_reg(msr, msr::MSR_PP0_ENERGY_STATUS, socket)?;
        sample.pp0_after.store(raw as f64);
        let raw = self.read_reg(msr, msr::MSR_PKG_ENERGY_STATUS, socket)?;
        sample.package_after.store(raw as f64);
        if cal.counts_dram() {
            let raw = self.read_reg(msr, msr::MSR_DRAM_ENERGY_STATUS, socket)?;
            sample.secondary_after.store(raw as f64);
        }

        sample
            .stop_ticks
            .store(self.platform.ticks(), Ordering::Relaxed);

        apply_energy_unit(sample, cal.units.energy, cal.counts_dram());
        Ok(())
    }
}

/// Scales both halves of a raw sample pair in one pass, so the hot start/stop
/// path pays for one multiplication per value instead of two reads' worth.
fn apply_energy_unit(sample: &SamplePair, energy_unit: f64, dram: bool) {
    let cells = [
        &sample.package_before,
        &sample.package_after,
        &sample.pp0_before,
        &sample.pp0_after,
    ];
    for cell in cells {
        cell.store(cell.load() * energy_unit);
    }
    if dram {
        sample.secondary_before.store(sample.secondary_before.load() * energy_unit);
        sample.secondary_after.store(sample.secondary_after.load() * energy_unit);
    }
}

impl<P: Platform> OwnerToken<'_, P> {
    /// [`RaplSampler::start_fast`] without the ownership gate; the token is
    /// the proof of exclusivity.
    pub fn start_fast(&self) -> Result<(), RaplError> {
        self.sampler.start_fast_socket(self.socket)
    }

    /// [`RaplSampler::stop_fast`] without the ownership gate.
    pub fn stop_fast(&self) -> Result<(), RaplError> {
        self.sampler.stop_fast_socket(self.socket)
    }
}

impl<P: Platform> ControllerToken<'_, P> {
    /// Starts a fast sample on every initialized socket. The start timestamp
    /// is captured once and broadcast, keeping cross-socket intervals
    /// comparable.
    pub fn start_all(&self) -> Result<(), RaplError> {
        let s = self.sampler;
        let now = s.platform.ticks();
        for slot in &s.slots {
            slot.sample.start_ticks.store(now, Ordering::Relaxed);
        }

        for socket in 0..s.slots.len() as u32 {
            if !s.slots[socket as usize].initialized.load(Ordering::Acquire) {
                continue;
            }
            self.read_fast_before(socket)?;
        }
        Ok(())
    }

    /// Stops the fast sample on every initialized socket: reads first, then
    /// one shared stop timestamp, then the deferred scaling pass.
    pub fn stop_all(&self) -> Result<(), RaplError> {
        let s = self.sampler;
        for socket in 0..s.slots.len() as u32 {
            if !s.slots[socket as usize].initialized.load(Ordering::Acquire) {
                continue;
            }
            self.read_fast_after(socket)?;
        }

        let now = s.platform.ticks();
        for slot in &s.slots {
            slot.sample.stop_ticks.store(now, Ordering::Relaxed);
        }

        let Some(cal) = s.calibration() else {
            return Ok(());
        };
        for slot in &s.slots {
            if slot.initialized.load(Ordering::Acquire) {
                apply_energy_unit(&slot.sample, cal.units.energy, cal.counts_dram());
            }
        }
        Ok(())
    }

    fn read_fast_before(&self, socket: u32) -> Result<(), RaplError> {
        let s = self.sampler;
        let Some((sample, msr, cal)) = s.socket_reader(socket) else {
            return Ok(());
        };
        if cal.counts_dram() {
            let raw = s.read_reg(msr, msr::MSR_DRAM_ENERGY_STATUS, socket)?;
            sample.secondary_before.store(raw as f64);
        }
        let raw = s.read_reg(msr, msr::MSR_PKG_ENERGY_STATUS, socket)?;
        sample.package_before.store(raw as f64);
        let raw = s.read_reg(msr, msr::MSR_PP0_ENERGY_STATUS, socket)?;
        sample.pp0_before.store(raw as f64);
        Ok(())
    }

    fn read_fast_after(&self, socket: u32) -> Result<(), RaplError> {
        let s = self.sampler;
        let Some((sample, msr, cal)) = s.socket_reader(socket) else {
            return Ok(());
        };
        let raw = s.read_reg(msr, msr::MSR_PP0_ENERGY_STATUS, socket)?;
        sample.pp0_after.store(raw as f64);
        let raw = s.read_reg(msr, msr::MSR_PKG_ENERGY_STATUS, socket)?;
        sample.package_after.store(raw as f64);
        if cal.counts_dram() {
            let raw = s.read_reg(msr, msr::MSR_DRAM_ENERGY_STATUS, socket)?;
            sample.secondary_after.store(raw as f64);
        }
        Ok(())
    }
}
