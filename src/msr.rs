// According to Intel 64 and IA-32 architectures software developer's manual,
// volume 3B, MSR_PKG_ENERGY_STATUS reports the measured energy usage of the
// package; the companion status registers cover the power planes and DRAM.

use std::fs::File;
use std::io;
use std::os::unix::prelude::FileExt;

use thiserror::Error;

pub type Addr = u64;

pub const MSR_RAPL_POWER_UNIT: Addr = 0x606;
pub const MSR_PKG_RAPL_POWER_LIMIT: Addr = 0x610;
pub const MSR_PKG_ENERGY_STATUS: Addr = 0x611;
pub const MSR_PKG_PERF_STATUS: Addr = 0x613;
pub const MSR_PKG_POWER_INFO: Addr = 0x614;
pub const MSR_DRAM_ENERGY_STATUS: Addr = 0x619;
pub const MSR_PP0_ENERGY_STATUS: Addr = 0x639;
pub const MSR_PP0_POLICY: Addr = 0x63a;
pub const MSR_PP0_PERF_STATUS: Addr = 0x63b;
pub const MSR_PP1_ENERGY_STATUS: Addr = 0x641;
pub const MSR_PP1_POLICY: Addr = 0x642;

/// MSR access failure. Open failures distinguish a nonexistent core from a
/// core without MSR support, so the caller can report them differently.
#[derive(Debug, Error)]
pub enum MsrError {
    #[error("no CPU {core}")]
    NoSuchCore { core: u32 },

    #[error("CPU {core} doesn't support MSRs")]
    MsrUnsupported { core: u32 },

    #[error("MSR I/O error")]
    Io(#[from] io::Error),
}

/// Reads a 64-bit value at a register offset. Implemented by [`MsrFile`] for
/// real hardware; tests provide synthetic registers.
pub trait RegisterAccess {
    fn read(&self, offset: Addr) -> Result<u64, MsrError>;
}

/// One core's MSR device, `/dev/cpu/<core>/msr`.
///
/// Reading requires root (or `CAP_SYS_RAWIO`) and the `msr` kernel module.
#[derive(Debug)]
pub struct MsrFile {
    file: File,
}

impl MsrFile {
    pub fn open(core: u32) -> Result<MsrFile, MsrError> {
        let path = format!("/dev/cpu/{core}/msr");
        match File::open(&path) {
            Ok(file) => Ok(MsrFile { file }),
            Err(e) => match e.raw_os_error() {
                Some(libc::ENXIO) => Err(MsrError::NoSuchCore { core }),
                Some(libc::EIO) => Err(MsrError::MsrUnsupported { core }),
                _ => Err(MsrError::Io(e)),
            },
        }
    }
}

impl RegisterAccess for MsrFile {
    fn read(&self, offset: Addr) -> Result<u64, MsrError> {
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_failure_without_a_device_node_is_generic_io() {
        // No /dev/cpu/<n>/msr node at all: not ENXIO, not EIO.
        let err = MsrFile::open(u32::MAX).unwrap_err();
        assert!(matches!(err, MsrError::Io(_)));
    }
}
