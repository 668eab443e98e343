use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cpu::CpuModel;
use crate::msr::{self, Addr, MsrError, RegisterAccess};
use crate::{Platform, RaplError, Topology};

/// Raw power-unit register with power exponent 3 (0.125 W), energy exponent
/// 16 (2^-16 J) and time exponent 10 (2^-10 s).
pub(crate) const UNIT_RAW: u64 = 3 | (16 << 8) | (10 << 16);

type Script = Arc<Mutex<HashMap<(u32, Addr), VecDeque<u64>>>>;

/// Synthetic [`Platform`]: scripted registers, a settable clock and a block
/// core-to-socket mapping.
pub(crate) struct MockPlatform {
    topology: Topology,
    model: Result<CpuModel, ()>,
    registers: Script,
    failing: Arc<Mutex<HashSet<(u32, Addr)>>>,
    pub(crate) unit_reads: Arc<AtomicUsize>,
    pub(crate) now: Arc<AtomicU64>,
    pub(crate) tick_hz: f64,
}

impl MockPlatform {
    /// 2 sockets x 4 cores of a client (PP1) model, units already scripted.
    pub(crate) fn two_sockets() -> MockPlatform {
        let platform = MockPlatform {
            topology: Topology::new(2, 4),
            model: Ok(CpuModel::Haswell),
            registers: Arc::default(),
            failing: Arc::default(),
            unit_reads: Arc::default(),
            now: Arc::default(),
            tick_hz: 1e9,
        };
        platform.script(0, msr::MSR_RAPL_POWER_UNIT, &[UNIT_RAW]);
        platform.script(1, msr::MSR_RAPL_POWER_UNIT, &[UNIT_RAW]);
        platform
    }

    /// Same topology, but on a server (DRAM-counting) model.
    pub(crate) fn two_server_sockets() -> MockPlatform {
        let mut platform = MockPlatform::two_sockets();
        platform.model = Ok(CpuModel::IvyBridgeEp);
        platform
    }

    pub(crate) fn with_unsupported_cpu(mut self) -> MockPlatform {
        self.model = Err(());
        self
    }

    /// Queues the values a register returns, in read order; the last value
    /// sticks for any further reads.
    pub(crate) fn script(&self, socket: u32, offset: Addr, values: &[u64]) {
        self.registers
            .lock()
            .unwrap()
            .insert((socket, offset), values.iter().copied().collect());
    }

    /// Makes every read of this register fail with an I/O error.
    pub(crate) fn fail(&self, socket: u32, offset: Addr) {
        self.failing.lock().unwrap().insert((socket, offset));
    }
}

impl Platform for MockPlatform {
    type Msr = MockMsr;

    fn open_msr(&self, core: u32) -> Result<MockMsr, MsrError> {
        Ok(MockMsr {
            socket: self.socket_of(core),
            registers: self.registers.clone(),
            failing: self.failing.clone(),
            unit_reads: self.unit_reads.clone(),
        })
    }

    fn detect_cpu_model(&self) -> Result<CpuModel, RaplError> {
        self.model
            .map_err(|_| RaplError::UnsupportedCpu("mock model".into()))
    }

    fn socket_of(&self, core: u32) -> u32 {
        core / self.topology.cores_per_socket
    }

    fn ticks(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn tick_rate_hz(&self) -> f64 {
        self.tick_hz
    }
}

pub(crate) struct MockMsr {
    socket: u32,
    registers: Script,
    failing: Arc<Mutex<HashSet<(u32, Addr)>>>,
    unit_reads: Arc<AtomicUsize>,
}

impl RegisterAccess for MockMsr {
    fn read(&self, offset: Addr) -> Result<u64, MsrError> {
        if self.failing.lock().unwrap().contains(&(self.socket, offset)) {
            return Err(MsrError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected read failure",
            )));
        }
        if offset == msr::MSR_RAPL_POWER_UNIT {
            self.unit_reads.fetch_add(1, Ordering::SeqCst);
        }
        let mut registers = self.registers.lock().unwrap();
        let value = match registers.get_mut(&(self.socket, offset)) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(0),
            Some(queue) => queue.front().copied().unwrap_or(0),
            None => 0,
        };
        Ok(value)
    }
}
