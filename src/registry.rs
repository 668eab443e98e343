use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

use log::{debug, info};

use crate::cpu::CpuModel;
use crate::units::{self, Calibration};
use crate::{Platform, RaplError, Topology};

/// Owner core ids are stored with this offset so that 0 can mean "unclaimed".
const OWNER_OFFSET: u32 = 1;

thread_local! {
    /// The (core, socket) pair the current thread bound at registration.
    static BOUND: Cell<Option<Binding>> = const { Cell::new(None) };
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    core: u32,
    socket: u32,
}

fn bound() -> Option<Binding> {
    BOUND.with(|b| b.get())
}

/// `f64` stored as bits, so the owning thread can publish samples without
/// locks and the reporter can read them after stop.
#[derive(Default)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Paired before/after counter readings and interval timestamps of one socket.
/// Written only by the socket's elected owner (or the bulk controller).
#[derive(Default)]
pub(crate) struct SamplePair {
    pub(crate) package_before: AtomicF64,
    pub(crate) package_after: AtomicF64,
    pub(crate) pp0_before: AtomicF64,
    pub(crate) pp0_after: AtomicF64,
    /// PP1 energy on client models, DRAM energy on server models.
    pub(crate) secondary_before: AtomicF64,
    pub(crate) secondary_after: AtomicF64,
    pub(crate) start_ticks: AtomicU64,
    pub(crate) stop_ticks: AtomicU64,
}

pub(crate) struct SocketSlot<M> {
    /// Core id + [`OWNER_OFFSET`] of the elected owner; 0 until claimed.
    pub(crate) owner: AtomicU32,
    pub(crate) initialized: AtomicBool,
    pub(crate) msr: OnceLock<M>,
    pub(crate) sample: SamplePair,
}

impl<M> Default for SocketSlot<M> {
    fn default() -> SocketSlot<M> {
        SocketSlot {
            owner: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            msr: OnceLock::new(),
            sample: SamplePair::default(),
        }
    }
}

/// Outcome of [`RaplSampler::register`].
pub enum Registration<'a, P: Platform> {
    /// The calling thread claimed the socket and performed the one-time unit
    /// calibration.
    OwnerFirst(OwnerToken<'a, P>),
    /// The calling thread claimed the socket; another registration already
    /// calibrated.
    Owner(OwnerToken<'a, P>),
    /// Another core owns the socket. The thread stays bound, so the gated
    /// sampling operations turn into no-ops for it.
    NotOwner,
}

impl<P: Platform> fmt::Debug for Registration<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Registration::OwnerFirst(t) => f.debug_tuple("OwnerFirst").field(&t.socket).finish(),
            Registration::Owner(t) => f.debug_tuple("Owner").field(&t.socket).finish(),
            Registration::NotOwner => f.write_str("NotOwner"),
        }
    }
}

/// Proof that the holder's thread won a socket's ownership election.
///
/// Required by the unguarded sampling variants; it cannot be cloned and is
/// only minted by a successful claim, so skipping the ownership gate without
/// actually owning the socket is a type error.
pub struct OwnerToken<'a, P: Platform> {
    pub(crate) sampler: &'a RaplSampler<P>,
    pub(crate) socket: u32,
}

impl<P: Platform> OwnerToken<'_, P> {
    pub fn socket(&self) -> u32 {
        self.socket
    }
}

/// Proof that one controlling thread initialized every socket through
/// [`RaplSampler::register_all`] and is the machine's only reader.
pub struct ControllerToken<'a, P: Platform> {
    pub(crate) sampler: &'a RaplSampler<P>,
}

/// Process-wide registry of per-socket sampling state.
///
/// One instance is shared by all participating threads. Each thread calls
/// [`register`](RaplSampler::register) with the core it runs on; the first
/// thread to claim a socket becomes its only reader, every other thread on
/// that socket is bound for gating and samples as a no-op.
pub struct RaplSampler<P: Platform> {
    pub(crate) platform: P,
    topology: Topology,
    pub(crate) slots: Vec<SocketSlot<P::Msr>>,
    model: OnceLock<CpuModel>,
    calibration: OnceLock<Calibration>,
    /// Election word for the one-shot calibration.
    calibrating: AtomicBool,
    /// Power-plane policies observed by the last full start.
    pub(crate) pp0_policy: AtomicU32,
    pub(crate) pp1_policy: AtomicU32,
    /// Accumulated throttled time, read on server models by the full start.
    pub(crate) pkg_throttled_s: AtomicF64,
    pub(crate) pp0_throttled_s: AtomicF64,
}

impl<P: Platform> RaplSampler<P> {
    pub fn new(platform: P, topology: Topology) -> RaplSampler<P> {
        let slots = (0..topology.sockets).map(|_| SocketSlot::default()).collect();
        RaplSampler {
            platform,
            topology,
            slots,
            model: OnceLock::new(),
            calibration: OnceLock::new(),
            calibrating: AtomicBool::new(false),
            pp0_policy: AtomicU32::new(0),
            pp1_policy: AtomicU32::new(0),
            pkg_throttled_s: AtomicF64::default(),
            pp0_throttled_s: AtomicF64::default(),
        }
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Binds the calling thread to the socket hosting `core` and tries to
    /// claim that socket's ownership.
    ///
    /// The winner opens the socket's MSR device and, if it is the first winner
    /// process-wide, calibrates the units. Losers stay bound so that the gated
    /// start/stop calls can be made symmetrically from every thread.
    pub fn register(&self, core: u32) -> Result<Registration<'_, P>, RaplError> {
        let socket = self.platform.socket_of(core);
        BOUND.with(|b| b.set(Some(Binding { core, socket })));

        let max = self.topology.total_cores();
        if core >= max || socket >= self.topology.sockets {
            return Err(RaplError::CoreOutOfRange { core, max });
        }

        let slot = &self.slots[socket as usize];
        if slot
            .owner
            .compare_exchange(0, core + OWNER_OFFSET, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("core {core}: socket {socket} is already owned");
            return Ok(Registration::NotOwner);
        }
        debug!("core {core}: now owns socket {socket}");

        let model = self.detect_model()?;
        let opened = self.platform.open_msr(core)?;
        let msr = slot.msr.get_or_init(|| opened);
        slot.initialized.store(true, Ordering::Release);

        let first = self.try_calibrate(msr, model)?;
        let token = OwnerToken {
            sampler: self,
            socket,
        };
        if first {
            Ok(Registration::OwnerFirst(token))
        } else {
            Ok(Registration::Owner(token))
        }
    }

    /// Single-controller registration: one thread takes every socket.
    ///
    /// Scans the core-to-socket mapping for one representative core per
    /// socket, opens each socket's MSR device and calibrates from socket 0.
    /// Socket owners stay unclaimed; sampling goes through the returned
    /// token's all-sockets operations.
    pub fn register_all(&self) -> Result<ControllerToken<'_, P>, RaplError> {
        let model = self.detect_model()?;

        for socket in 0..self.topology.sockets {
            let core = (0..self.topology.total_cores())
                .find(|&c| self.platform.socket_of(c) == socket)
                .ok_or(RaplError::NoCoreOnSocket { socket })?;

            let slot = &self.slots[socket as usize];
            let opened = self.platform.open_msr(core)?;
            slot.msr.get_or_init(|| opened);
            slot.initialized.store(true, Ordering::Release);
        }

        let first = self.slots[0]
            .msr
            .get()
            .ok_or(RaplError::NoCoreOnSocket { socket: 0 })?;
        self.try_calibrate(first, model)?;
        info!("registered all {} sockets", self.topology.sockets);

        Ok(ControllerToken { sampler: self })
    }

    fn detect_model(&self) -> Result<CpuModel, RaplError> {
        if let Some(model) = self.model.get() {
            return Ok(*model);
        }
        let model = self.platform.detect_cpu_model()?;
        Ok(*self.model.get_or_init(|| model))
    }

    /// One-shot calibration, guarded by an atomic election so the underlying
    /// register reads happen exactly once no matter how many sockets register
    /// concurrently. Returns whether this call won the election.
    fn try_calibrate(&self, msr: &P::Msr, model: CpuModel) -> Result<bool, RaplError> {
        if self
            .calibrating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        match units::calibrate(msr, model) {
            Ok(calibration) => {
                let _ = self.calibration.set(calibration);
                Ok(true)
            }
            Err(e) => {
                // Let a later registration retry instead of staying
                // permanently uncalibrated.
                self.calibrating.store(false, Ordering::Release);
                Err(RaplError::RegisterAccess(e))
            }
        }
    }

    /// The shared units and descriptive power info, once calibrated.
    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.get()
    }

    pub fn cpu_model(&self) -> Option<CpuModel> {
        self.model.get().copied()
    }

    /// Number of sockets currently in the active (initialized) set.
    pub fn active_sockets(&self) -> u32 {
        self.slots
            .iter()
            .filter(|s| s.initialized.load(Ordering::Acquire))
            .count() as u32
    }

    /// PP0 policy bits observed by the last full start.
    pub fn pp0_policy(&self) -> u32 {
        self.pp0_policy.load(Ordering::Relaxed)
    }

    /// PP1 policy bits observed by the last full start (client models only).
    pub fn pp1_policy(&self) -> u32 {
        self.pp1_policy.load(Ordering::Relaxed)
    }

    /// Accumulated package throttled time observed by the last full start
    /// (server models only).
    pub fn package_throttled_time_s(&self) -> f64 {
        self.pkg_throttled_s.load()
    }

    /// Accumulated PP0 throttled time observed by the last full start
    /// (server models only).
    pub fn pp0_throttled_time_s(&self) -> f64 {
        self.pp0_throttled_s.load()
    }

    pub(crate) fn current_socket(&self) -> Option<u32> {
        bound().map(|b| b.socket)
    }

    /// True when the calling thread's socket is initialized and this thread's
    /// core won that socket's election. Every sampling operation that touches
    /// shared per-socket state consults this gate.
    pub fn is_active(&self) -> bool {
        let Some(b) = bound() else {
            return false;
        };
        let Some(slot) = self.slots.get(b.socket as usize) else {
            return false;
        };
        slot.initialized.load(Ordering::Acquire)
            && slot.owner.load(Ordering::Acquire) == b.core + OWNER_OFFSET
    }

    /// Like [`is_active`](RaplSampler::is_active), but additionally requires
    /// the thread's socket to be the lowest-indexed initialized socket, so
    /// whole-machine operations run exactly once across all owner threads.
    pub fn is_sole_reporter(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let Some(b) = bound() else {
            return false;
        };
        let min = self
            .slots
            .iter()
            .position(|s| s.initialized.load(Ordering::Acquire));
        min == Some(b.socket as usize)
    }

    /// Gated teardown: retires the calling thread's socket from the active
    /// set. Subsequent gated operations on it become no-ops and the
    /// statistics stop covering it; the MSR device itself is closed when the
    /// sampler is dropped.
    pub fn release(&self) {
        if !self.is_active() {
            return;
        }
        let Some(b) = bound() else {
            return;
        };
        self.slots[b.socket as usize]
            .initialized
            .store(false, Ordering::Release);
        debug!("core {}: released socket {}", b.core, b.socket);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::thread;

    use super::*;
    use crate::testutil::MockPlatform;

    #[test]
    fn election_picks_exactly_one_owner_per_socket() {
        let platform = MockPlatform::two_sockets();
        let sampler = RaplSampler::new(platform, Topology::new(2, 4));

        // 4 cores of socket 0 race for the claim.
        thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|core| {
                    let sampler = &sampler;
                    scope.spawn(move || {
                        let won = matches!(
                            sampler.register(core).unwrap(),
                            Registration::Owner(_) | Registration::OwnerFirst(_)
                        );
                        (won, sampler.is_active())
                    })
                })
                .collect();

            let results: Vec<(bool, bool)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(results.iter().filter(|(won, _)| *won).count(), 1);
            // The gate agrees with the election on every thread.
            for (won, active) in results {
                assert_eq!(won, active);
            }
        });
    }

    #[test]
    fn calibration_reads_units_exactly_once() {
        let platform = MockPlatform::two_sockets();
        let unit_reads = platform.unit_reads.clone();
        let sampler = RaplSampler::new(platform, Topology::new(2, 4));

        thread::scope(|scope| {
            for core in [0, 1, 4, 5] {
                let sampler = &sampler;
                scope.spawn(move || {
                    sampler.register(core).unwrap();
                });
            }
        });

        assert_eq!(unit_reads.load(Ordering::SeqCst), 1);
        assert!(sampler.calibration().is_some());
        assert_eq!(sampler.active_sockets(), 2);
    }

    #[test]
    fn exactly_one_first_owner_across_sockets() {
        let platform = MockPlatform::two_sockets();
        let sampler = RaplSampler::new(platform, Topology::new(2, 4));

        thread::scope(|scope| {
            let handles: Vec<_> = [0u32, 4]
                .into_iter()
                .map(|core| {
                    let sampler = &sampler;
                    scope.spawn(move || {
                        matches!(sampler.register(core).unwrap(), Registration::OwnerFirst(_))
                    })
                })
                .collect();
            let firsts = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|&won| won)
                .count();
            assert_eq!(firsts, 1);
        });
    }

    #[test]
    fn out_of_range_core_is_rejected() {
        let platform = MockPlatform::two_sockets();
        let sampler = RaplSampler::new(platform, Topology::new(2, 4));
        let err = sampler.register(8).unwrap_err();
        assert!(matches!(err, RaplError::CoreOutOfRange { core: 8, max: 8 }));
    }

    #[test]
    fn unsupported_cpu_fails_registration() {
        let platform = MockPlatform::two_sockets().with_unsupported_cpu();
        let sampler = RaplSampler::new(platform, Topology::new(2, 4));
        let err = sampler.register(0).unwrap_err();
        assert!(matches!(err, RaplError::UnsupportedCpu(_)));
        // The failed winner must not leave the socket half-initialized.
        assert_eq!(sampler.active_sockets(), 0);
        assert!(!sampler.is_active());
    }

    #[test]
    fn sole_reporter_is_the_lowest_initialized_socket() {
        let platform = MockPlatform::two_sockets();
        let sampler = RaplSampler::new(platform, Topology::new(2, 4));

        thread::scope(|scope| {
            let s = &sampler;
            let low = scope.spawn(move || {
                s.register(0).unwrap();
                s.is_sole_reporter()
            });
            let high = scope.spawn(move || {
                s.register(4).unwrap();
                // Wait for socket 0 to come up, then check.
                while s.active_sockets() < 2 {
                    thread::yield_now();
                }
                s.is_sole_reporter()
            });
            assert!(low.join().unwrap());
            assert!(!high.join().unwrap());
        });
    }

    #[test]
    fn register_all_initializes_every_socket() {
        let platform = MockPlatform::two_sockets();
        let unit_reads = platform.unit_reads.clone();
        let sampler = RaplSampler::new(platform, Topology::new(2, 4));

        let _controller = sampler.register_all().unwrap();
        assert_eq!(sampler.active_sockets(), 2);
        assert_eq!(unit_reads.load(Ordering::SeqCst), 1);
        // The controller topology claims no per-socket owner.
        assert!(!sampler.is_active());
    }

    #[test]
    fn release_retires_the_socket() {
        let platform = MockPlatform::two_sockets();
        let sampler = RaplSampler::new(platform, Topology::new(2, 4));
        sampler.register(0).unwrap();
        assert!(sampler.is_active());
        sampler.release();
        assert!(!sampler.is_active());
        assert_eq!(sampler.active_sockets(), 0);
    }
}
