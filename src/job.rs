use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{self, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum State { Active, Stopped, Terminated }

pub trait WaitStatusExt {
	fn state(self) -> State;
}

impl WaitStatusExt for WaitStatus {
	fn state(self) -> State {
		match self {
			WaitStatus::Exited(..) => State::Terminated,
			WaitStatus::Signaled(..) => State::Terminated,
			WaitStatus::Stopped(..) => State::Stopped,
			#[cfg(any(target_os = "linux", target_os = "android"))]
			WaitStatus::PtraceEvent(..) => State::Stopped,
			#[cfg(any(target_os = "linux", target_os = "android"))]
			WaitStatus::PtraceSyscall(..) => State::Stopped,
			WaitStatus::Continued(..) => State::Active,
			WaitStatus::StillAlive => State::Active,
		}
	}
}

const NONE: i32 = 0;

fn load(slot: &AtomicI32) -> Option<Pid> {
	match slot.load(Ordering::SeqCst) {
		NONE => None,
		raw => Some(Pid::from_raw(raw)),
	}
}

/// Job bookkeeping shared between the control loop and the signal handlers.
///
/// Every field is a single word written in one store, so a handler that
/// interrupts the loop never sees a half-updated state.
#[derive(Debug, Default)]
pub struct JobState {
	foreground: AtomicI32,
	stopped: AtomicI32,
	waiting: AtomicBool,
}

impl JobState {
	pub fn new() -> JobState {
		JobState::default()
	}

	/// Most recently launched foreground process.
	pub fn foreground(&self) -> Option<Pid> {
		load(&self.foreground)
	}

	/// Most recently stopped process. A later stop overwrites it.
	pub fn stopped(&self) -> Option<Pid> {
		load(&self.stopped)
	}

	pub fn set_foreground(&self, pid: Pid) {
		self.foreground.store(pid.as_raw(), Ordering::SeqCst);
	}

	pub fn stopped_is_alive(&self) -> bool {
		self.stopped().map_or(false, is_alive)
	}

	/// Reaction to the shell itself receiving a stop request.
	///
	/// Runs inside the signal handler: atomics, `waitid` and `kill` only.
	pub fn on_stop_request(&self) {
		let pid = match self.foreground() {
			Some(pid) => pid,
			None => return,
		};
		if !is_alive(pid) {
			return;
		}
		self.stopped.store(pid.as_raw(), Ordering::SeqCst);
		if self.waiting.load(Ordering::SeqCst) {
			let _ = signal::kill(pid, Signal::SIGTSTP);
		}
	}

	/// Continues the last stopped process without waiting for it.
	pub fn resume(&self) -> nix::Result<Pid> {
		let pid = self.stopped().ok_or(Errno::ESRCH)?;
		signal::kill(pid, Signal::SIGCONT)?;
		debug!(pid = pid.as_raw(), "resumed in background");
		Ok(pid)
	}

	/// Blocks until `pid` exits or stops.
	pub fn wait_foreground(&self, pid: Pid) -> State {
		self.waiting.store(true, Ordering::SeqCst);
		let state = loop {
			match wait::waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
				Ok(status) => match status.state() {
					State::Active => continue,
					state => break state,
				},
				Err(Errno::EINTR) => continue,
				// collected by the reaper first
				Err(Errno::ECHILD) => break State::Terminated,
				Err(e) => {
					warn!(pid = pid.as_raw(), "waitpid failed: {}", e);
					break State::Terminated;
				},
			}
		};
		self.waiting.store(false, Ordering::SeqCst);
		if state == State::Stopped {
			self.stopped.store(pid.as_raw(), Ordering::SeqCst);
		}
		debug!(pid = pid.as_raw(), ?state, "foreground wait finished");
		state
	}
}

/// True while `pid` has not exited. Never consumes an exit status.
fn is_alive(pid: Pid) -> bool {
	let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
	match wait::waitid(Id::Pid(pid), flags) {
		Ok(WaitStatus::StillAlive) => true,
		_ => false,
	}
}

/// Collects every exited child without blocking. Returns how many were collected.
pub fn reap_exited() -> usize {
	let mut reaped = 0;
	loop {
		match wait::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
			Ok(WaitStatus::StillAlive) | Err(_) => break,
			Ok(_) => reaped += 1,
		}
	}
	reaped
}

static INSTALLED: OnceLock<Arc<JobState>> = OnceLock::new();

/// Runs `f` and puts `errno` back, so the interrupted code still sees its own.
fn preserving_errno<F>(f: F) where F: FnOnce() {
	let saved = Errno::last_raw();
	f();
	Errno::set_raw(saved);
}

extern "C" fn on_sigchld(_: libc::c_int) {
	preserving_errno(|| {
		reap_exited();
	});
}

extern "C" fn on_sigtstp(_: libc::c_int) {
	preserving_errno(|| {
		if let Some(jobs) = INSTALLED.get() {
			jobs.on_stop_request();
		}
	});
}

/// Hands `jobs` to the signal handlers and installs them for good.
pub fn install(jobs: Arc<JobState>) -> nix::Result<()> {
	if INSTALLED.set(jobs).is_err() {
		return Err(Errno::EBUSY);
	}
	for &(sig, handler) in &[
		(Signal::SIGCHLD, on_sigchld as extern "C" fn(libc::c_int)),
		(Signal::SIGTSTP, on_sigtstp as extern "C" fn(libc::c_int)),
	] {
		let action = SigAction::new(SigHandler::Handler(handler), SaFlags::SA_RESTART, SigSet::empty());
		unsafe { signal::sigaction(sig, &action) }?;
	}
	Ok(())
}

/// Puts job-control signals back to their defaults. Called in a forked child.
pub fn reset_child_signals() {
	for &sig in &[Signal::SIGCHLD, Signal::SIGTSTP] {
		let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
	}
}

/// Keeps SIGCHLD blocked while processes are forked and registered.
pub struct SigchldBlock {
	previous: SigSet,
}

impl SigchldBlock {
	pub fn new() -> nix::Result<SigchldBlock> {
		let mut set = SigSet::empty();
		set.add(Signal::SIGCHLD);
		let mut previous = SigSet::empty();
		signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut previous))?;
		Ok(SigchldBlock { previous: previous })
	}

	/// The mask survives exec, so a child must restore it itself.
	pub fn restore_in_child(&self) {
		let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
	}
}

impl Drop for SigchldBlock {
	fn drop(&mut self) {
		let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
	}
}
