//! Reconciles SIGCHLD-driven reaping with the engine's own waits.
//!
//! While armed, the SIGCHLD handler reaps terminated children on the
//! engine's behalf. While disarmed it does nothing, and the engine waits
//! synchronously. Every touch of the shared state from the main flow runs
//! with SIGCHLD blocked on the calling thread, so the handler never sees it
//! half-updated.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError, TryLockError};

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, trace};

use crate::pidset::ProcessSet;

pub trait WaitStatusExt {
	fn code(self) -> i32;
	fn is_terminated(self) -> bool;
}

impl WaitStatusExt for WaitStatus {
	/// Shell-style status: the exit code, or 128 plus the terminating signal.
	fn code(self) -> i32 {
		match self {
			WaitStatus::Exited(_, code) => code,
			WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
			_ => 0,
		}
	}
	fn is_terminated(self) -> bool {
		match self {
			WaitStatus::Exited(..) | WaitStatus::Signaled(..) => true,
			_ => false,
		}
	}
}

#[derive(Debug, Default)]
struct Shared {
	armed: bool,
	/// Children of the line being executed.
	live: ProcessSet,
	/// Reaped by the handler but not found in `live`.
	reaped_async: ProcessSet,
	/// Reaped by the engine's own wait-any but not found in `live`.
	reaped_sync: ProcessSet,
}

impl Shared {
	fn claim_async(&mut self, pid: Pid) {
		if !self.live.remove_exact(pid) {
			self.reaped_async.insert(pid);
		}
	}

	fn claim_sync(&mut self, pid: Pid) {
		if !self.live.remove_exact(pid) {
			self.reaped_sync.insert(pid);
		}
	}

	/// Runs in the handler, which must not allocate: a reaped pid missing
	/// from `live` needs a free slot in `reaped_async`. Without one, the
	/// remaining zombies are left for a synchronous wait.
	fn reap_ready(&mut self) {
		while self.reaped_async.has_room() {
			match wait::waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
				Ok(status) if status.is_terminated() => match status.pid() {
					Some(pid) => self.claim_async(pid),
					None => break,
				},
				Ok(WaitStatus::StillAlive) | Err(_) => break,
				Ok(_) => continue,
			}
		}
	}
}

static SHARED: OnceLock<Mutex<Shared>> = OnceLock::new();

extern "C" fn on_sigchld(_: libc::c_int) {
	let saved = Errno::last_raw();
	if let Some(shared) = SHARED.get() {
		let guard = match shared.try_lock() {
			Ok(guard) => Some(guard),
			Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
			Err(TryLockError::WouldBlock) => None,
		};
		if let Some(mut shared) = guard {
			if shared.armed {
				shared.reap_ready();
			}
		}
	}
	Errno::set_raw(saved);
}

fn sigchld_set() -> SigSet {
	let mut set = SigSet::empty();
	set.add(Signal::SIGCHLD);
	set
}

/// Restores the previous signal mask when dropped.
struct Blocked {
	old: SigSet,
}

impl Blocked {
	fn new() -> Blocked {
		let mut old = SigSet::empty();
		let _ = signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&sigchld_set()), Some(&mut old));
		Blocked { old: old }
	}
}

impl Drop for Blocked {
	fn drop(&mut self) {
		let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.old), None);
	}
}

/// Handle to the process-wide reaping state.
///
/// There is exactly one SIGCHLD disposition per process, so every handle
/// refers to the same state; `install` is idempotent.
#[derive(Debug, Clone, Copy)]
pub struct ReapCoordinator {
	shared: &'static Mutex<Shared>,
}

impl ReapCoordinator {
	pub fn install() -> nix::Result<ReapCoordinator> {
		let mut fresh = false;
		let shared = SHARED.get_or_init(|| {
			fresh = true;
			Mutex::new(Shared::default())
		});
		if fresh {
			let action = SigAction::new(
				SigHandler::Handler(on_sigchld),
				SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
				SigSet::empty(),
			);
			unsafe { signal::sigaction(Signal::SIGCHLD, &action) }?;
			debug!("SIGCHLD handler installed");
		}
		Ok(ReapCoordinator { shared: shared })
	}

	fn lock(&self) -> MutexGuard<'_, Shared> {
		self.shared.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Runs `f` inside the critical section.
	fn with<R, F>(&self, f: F) -> R where F: FnOnce(&mut Shared) -> R {
		let _blocked = Blocked::new();
		let mut shared = self.lock();
		f(&mut shared)
	}

	pub fn arm(&self) {
		self.with(|s| s.armed = true);
		trace!("reaping armed");
	}

	pub fn disarm(&self) {
		self.with(|s| s.armed = false);
		trace!("reaping disarmed");
	}

	pub fn is_armed(&self) -> bool {
		self.with(|s| s.armed)
	}

	/// Preallocates room for `additional` more pids in every set, so the
	/// handler never has to grow one.
	pub fn reserve(&self, additional: usize) {
		self.with(|s| {
			s.live.reserve(additional);
			s.reaped_async.reserve(additional);
			s.reaped_sync.reserve(additional);
		});
	}

	/// Capacity of the set the handler records unclaimed pids in.
	pub fn reaped_capacity(&self) -> usize {
		self.with(|s| s.reaped_async.capacity())
	}

	/// Forks and records the child in the live set atomically with respect
	/// to the handler. Returns the child pid and whether that pid was still
	/// listed as reaped, i.e. the kernel recycled a pid whose earlier owner
	/// is still recorded in some deferred set.
	pub fn fork(&self) -> nix::Result<Forked> {
		let _blocked = Blocked::new();
		let mut shared = self.lock();
		match unsafe { unistd::fork() }? {
			ForkResult::Parent { child } => {
				let recycled = shared.reaped_async.remove_exact(child) | shared.reaped_sync.remove_exact(child);
				shared.live.insert(child);
				Ok(Forked::Parent { child: child, recycled: recycled })
			},
			// Unlocking and unblocking here only touch the child's copies.
			ForkResult::Child => Ok(Forked::Child),
		}
	}

	/// Blocks for any child after a failed fork. Must be called disarmed.
	pub fn reap_any(&self) -> nix::Result<Pid> {
		loop {
			match wait::wait() {
				Ok(status) => match status.pid() {
					Some(pid) if status.is_terminated() => {
						self.with(|s| s.claim_sync(pid));
						debug!(%pid, code = status.code(), "reaped while recovering from fork failure");
						return Ok(pid);
					},
					_ => continue,
				},
				Err(Errno::EINTR) => continue,
				Err(e) => return Err(e),
			}
		}
	}

	/// Moves the live set of the current line out of the shared state.
	pub fn take_live(&self) -> ProcessSet {
		self.with(|s| s.live.take())
	}

	/// Drops from `set` every pid some other path has already reaped.
	pub fn reconcile(&self, set: &mut ProcessSet) {
		self.with(|s| {
			set.remove_intersection(&mut s.reaped_async);
			set.remove_intersection(&mut s.reaped_sync);
		});
	}

	/// Waits for one specific child. Must be called disarmed and after
	/// `reconcile`, so `pid` cannot have been reaped elsewhere.
	pub fn wait_for(&self, pid: Pid) -> nix::Result<WaitStatus> {
		loop {
			match wait::waitpid(pid, None) {
				Ok(status) if status.is_terminated() => return Ok(status),
				Ok(_) | Err(Errno::EINTR) => continue,
				Err(e) => return Err(e),
			}
		}
	}

	/// Collects `pid` if it has already terminated, without blocking.
	pub fn try_wait(&self, pid: Pid) -> nix::Result<Option<WaitStatus>> {
		match wait::waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
			Ok(WaitStatus::StillAlive) => Ok(None),
			Ok(status) if status.is_terminated() => Ok(Some(status)),
			Ok(_) => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Number of pids currently held by the coordinator.
	pub fn tracked(&self) -> usize {
		self.with(|s| s.live.len() + s.reaped_async.len() + s.reaped_sync.len())
	}
}

// Tests that wait on "any child" of the test process must not overlap.
#[cfg(test)]
pub(crate) static CHILD_TESTS: Mutex<()> = Mutex::new(());

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Forked {
	Parent { child: Pid, recycled: bool },
	Child,
}
