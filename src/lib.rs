use std::path::Path;
use std::{fmt, fs};

use thiserror::Error;

use crate::cpu::CpuModel;
use crate::msr::{MsrError, MsrFile, RegisterAccess};

pub mod cpu;
pub mod msr;
pub mod registry;
pub mod report;
pub mod sampler;
pub mod stats;
pub mod units;

#[cfg(test)]
pub(crate) mod testutil;

pub use registry::{ControllerToken, OwnerToken, RaplSampler, Registration};
pub use stats::RaplStats;

/// Failures reported by registration and sampling.
#[derive(Debug, Error)]
pub enum RaplError {
    /// The core id exceeds the configured socket × cores-per-socket capacity.
    #[error("core {core} is out of range for the configured topology of {max} cores")]
    CoreOutOfRange { core: u32, max: u32 },

    /// No representative core could be found for a socket during bulk registration.
    #[error("no core maps to socket {socket}")]
    NoCoreOnSocket { socket: u32 },

    /// The CPU is not one of the supported Intel microarchitectures.
    #[error("unsupported processor: {0}")]
    UnsupportedCpu(String),

    /// MSR open or read failure during registration or calibration.
    #[error("register access failed during initialization")]
    RegisterAccess(#[from] MsrError),

    /// MSR read failure during steady-state start/stop sampling.
    #[error("MSR read failed while sampling socket {socket}")]
    SamplingIo { socket: u32, source: MsrError },
}

/// How many sockets the machine has and how many cores live on each.
///
/// Core ids in `[0, sockets * cores_per_socket)` are accepted by
/// [`RaplSampler::register`](registry::RaplSampler::register).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub sockets: u32,
    pub cores_per_socket: u32,
}

impl Topology {
    pub fn new(sockets: u32, cores_per_socket: u32) -> Topology {
        Topology {
            sockets,
            cores_per_socket,
        }
    }

    pub fn total_cores(&self) -> u32 {
        self.sockets * self.cores_per_socket
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sockets x {} cores", self.sockets, self.cores_per_socket)
    }
}

/// Platform capabilities consumed by the sampler: per-core MSR access, CPU
/// model identification, core-to-socket mapping and a high-resolution clock.
///
/// The production implementation is [`SystemPlatform`]; tests substitute
/// synthetic registers and clocks.
pub trait Platform: Send + Sync {
    type Msr: RegisterAccess + Send + Sync;

    /// Opens the per-core register access path.
    fn open_msr(&self, core: u32) -> Result<Self::Msr, MsrError>;

    /// Identifies the CPU family/model, or fails on unrecognized hardware.
    fn detect_cpu_model(&self) -> Result<CpuModel, RaplError>;

    /// Maps a core id to the socket that hosts it.
    fn socket_of(&self, core: u32) -> u32;

    /// Current value of the high-resolution tick counter.
    fn ticks(&self) -> u64;

    /// Tick-to-second conversion rate (nominal core clock, in Hz).
    fn tick_rate_hz(&self) -> f64;
}

/// [`Platform`] backed by `/dev/cpu/<core>/msr`, `/proc/cpuinfo`, the sysfs
/// CPU topology and the timestamp counter.
pub struct SystemPlatform {
    topology: Topology,
    core_clock_hz: f64,
}

impl SystemPlatform {
    /// `core_clock_hz` is the nominal core clock used to convert tick deltas
    /// into seconds. On non-x86_64 targets the tick source falls back to a
    /// nanosecond clock, so pass `1e9` there.
    pub fn new(topology: Topology, core_clock_hz: f64) -> SystemPlatform {
        SystemPlatform {
            topology,
            core_clock_hz,
        }
    }
}

impl Platform for SystemPlatform {
    type Msr = MsrFile;

    fn open_msr(&self, core: u32) -> Result<MsrFile, MsrError> {
        MsrFile::open(core)
    }

    fn detect_cpu_model(&self) -> Result<CpuModel, RaplError> {
        cpu::detect_cpu_model()
    }

    fn socket_of(&self, core: u32) -> u32 {
        // Prefer the kernel's own mapping; fall back to block assignment
        // when the sysfs node is missing (e.g. inside containers).
        let path = format!("/sys/devices/system/cpu/cpu{core}/topology/physical_package_id");
        if let Some(id) = read_sysfs_u32(Path::new(&path)) {
            return id;
        }
        core / self.topology.cores_per_socket
    }

    #[cfg(target_arch = "x86_64")]
    fn ticks(&self) -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn ticks(&self) -> u64 {
        use std::sync::OnceLock;
        use std::time::Instant;
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }

    fn tick_rate_hz(&self) -> f64 {
        self.core_clock_hz
    }
}

fn read_sysfs_u32(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim_end().parse().ok()
}
