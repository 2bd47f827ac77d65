use std::ffi::{CString, NulError};
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::unistd::{self, ForkResult, Pid};
use thiserror::Error;
use tracing::{debug, warn};

use crate::job::{self, JobState, SigchldBlock};
use crate::types::{Command, Position, Redirect};
use crate::vars::Vars;

#[derive(Debug, Error)]
pub enum LaunchError {
	#[error("no arguments")]
	NoArguments,
	#[error("forking failed: {0}")]
	Fork(Errno),
	#[error("pipe: {0}")]
	Pipe(Errno),
	#[error("cannot open file {path}: {source}")]
	Redirect { path: String, source: io::Error },
	#[error("don't use '$' in the name of the file")]
	FileVariable,
	#[error("{program}: command not found")]
	NotFound { program: String },
	#[error("{program}: {errno}")]
	Exec { program: String, errno: Errno },
	#[error("{program}: cannot set up standard streams: {errno}")]
	Wire { program: String, errno: Errno },
	#[error("argument contains a nul byte")]
	Nul(#[from] NulError),
	#[error("cannot read exec status: {0}")]
	Status(io::Error),
	#[error("cannot block SIGCHLD: {0}")]
	SignalMask(Errno),
}

impl LaunchError {
	/// The shell cannot go on after these.
	pub fn is_fatal(&self) -> bool {
		match *self {
			LaunchError::Pipe(_) | LaunchError::SignalMask(_) => true,
			_ => false,
		}
	}

	/// A process was forked before the failure.
	pub fn spawned(&self) -> bool {
		match *self {
			LaunchError::NotFound { .. } | LaunchError::Exec { .. } | LaunchError::Wire { .. } | LaunchError::Status(_) => true,
			_ => false,
		}
	}
}

/// Everything a child needs, built before forking so the child only wires
/// descriptors and execs.
struct Prepared {
	program: String,
	argv: Vec<CString>,
	stdout_file: Option<File>,
	/// Exit status of a child whose exec failed.
	argc: i32,
}

impl Prepared {
	fn new(mut command: Command, vars: &Vars) -> Result<Prepared, LaunchError> {
		let stdout_file = match Redirect::extract(&mut command.argv) {
			Some(redirect) => Some(open_target(redirect, vars)?),
			None => None,
		};
		let program = command.argv.first().cloned().ok_or(LaunchError::NoArguments)?;
		let argv = command.argv.into_iter().map(CString::new).collect::<Result<Vec<_>, _>>()?;
		let argc = argv.len() as i32;
		Ok(Prepared { program: program, argv: argv, stdout_file: stdout_file, argc: argc })
	}
}

fn open_target(redirect: Redirect, vars: &Vars) -> Result<File, LaunchError> {
	let path = if redirect.target.starts_with('$') {
		vars.get(&redirect.target[1 ..]).ok_or(LaunchError::FileVariable)?.to_string()
	} else {
		redirect.target
	};
	OpenOptions::new().write(true).create(true).truncate(true).mode(0o666).open(&path)
		.map_err(|e| LaunchError::Redirect { path: path, source: e })
}

/// Processes forked for one command line entry. Background work is moved into
/// a process group of its own, led by the first process.
struct JobBuilder {
	detached: bool,
	gid: Option<Pid>,
	pids: Vec<Pid>,
	/// Read ends of the exec-status pipes, with the stage each belongs to.
	statuses: Vec<(usize, OwnedFd)>,
}

impl JobBuilder {
	fn new(detached: bool, size_hint: usize) -> JobBuilder {
		JobBuilder {
			detached: detached,
			gid: None,
			pids: Vec::with_capacity(size_hint),
			statuses: Vec::with_capacity(size_hint),
		}
	}

	fn push_fork(&mut self) -> nix::Result<ForkResult> {
		let r = unsafe { unistd::fork() }?;
		match r {
			ForkResult::Parent { child } => {
				if self.detached {
					let gid = *self.gid.get_or_insert(child);
					// the child does the same, whichever runs first wins
					let _ = unistd::setpgid(child, gid);
				}
				self.pids.push(child);
			},
			ForkResult::Child => {
				if self.detached {
					let _ = unistd::setpgid(Pid::from_raw(0), self.gid.unwrap_or(Pid::from_raw(0)));
				}
			},
		}
		Ok(r)
	}
}

const WIRE_FAILED: u8 = 0;
const EXEC_FAILED: u8 = 1;

fn wire(stdin: Option<&OwnedFd>, stdout: Option<&OwnedFd>, file: Option<&File>) -> nix::Result<()> {
	if let Some(fd) = stdin {
		unistd::dup2(fd.as_raw_fd(), libc::STDIN_FILENO)?;
	}
	if let Some(fd) = stdout {
		unistd::dup2(fd.as_raw_fd(), libc::STDOUT_FILENO)?;
	}
	if let Some(file) = file {
		unistd::dup2(file.as_raw_fd(), libc::STDOUT_FILENO)?;
	}
	Ok(())
}

fn exec_command(prepared: &Prepared, stdin: Option<&OwnedFd>, stdout: Option<&OwnedFd>, status: OwnedFd) -> ! {
	let (tag, errno) = match wire(stdin, stdout, prepared.stdout_file.as_ref()) {
		Err(e) => (WIRE_FAILED, e),
		Ok(()) => match unistd::execvp(&prepared.argv[0], &prepared.argv) {
			Err(e) => (EXEC_FAILED, e),
			Ok(never) => match never {},
		},
	};
	let mut report = [tag; 5];
	report[1 ..].copy_from_slice(&(errno as i32).to_ne_bytes());
	let _ = unistd::write(&status, &report);
	unsafe { libc::_exit(prepared.argc) }
}

fn exec_outcome(program: &str, report: &[u8]) -> Result<(), LaunchError> {
	if report.len() < 5 {
		return Ok(());
	}
	let errno = Errno::from_raw(i32::from_ne_bytes([report[1], report[2], report[3], report[4]]));
	let program = program.to_string();
	Err(match (report[0], errno) {
		(EXEC_FAILED, Errno::ENOENT) => LaunchError::NotFound { program: program },
		(EXEC_FAILED, errno) => LaunchError::Exec { program: program, errno: errno },
		(_, errno) => LaunchError::Wire { program: program, errno: errno },
	})
}

/// Forks the process for stage `stage` without waiting for it to reach exec.
fn spawn(job: &mut JobBuilder, stage: usize, prepared: &Prepared, stdin: Option<&OwnedFd>,
         stdout: Option<&OwnedFd>, mask: &SigchldBlock) -> Result<Pid, LaunchError> {
	let (status_read, status_write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(LaunchError::Pipe)?;
	match job.push_fork().map_err(LaunchError::Fork)? {
		ForkResult::Child => {
			drop(status_read);
			job::reset_child_signals();
			mask.restore_in_child();
			exec_command(prepared, stdin, stdout, status_write);
		},
		ForkResult::Parent { child } => {
			drop(status_write);
			job.statuses.push((stage, status_read));
			debug!(pid = child.as_raw(), program = %prepared.program, "forked");
			Ok(child)
		},
	}
}

/// Reads what a child wrote to its status pipe. Without `block`, a child
/// that has not reached exec yet gives `None` instead of stalling the shell.
fn read_status(status: OwnedFd, block: bool) -> io::Result<Option<Vec<u8>>> {
	if !block {
		fcntl::fcntl(status.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
	}
	let mut report = Vec::with_capacity(5);
	match File::from(status).read_to_end(&mut report) {
		Ok(_) => Ok(Some(report)),
		Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
			// the report is written in one piece, before `_exit`
			Ok(if report.is_empty() { None } else { Some(report) })
		},
		Err(e) => Err(e),
	}
}

fn collect_statuses(job: &mut JobBuilder, prepared: &[Prepared], block: bool, failure: &mut Option<LaunchError>) {
	for (stage, status) in job.statuses.drain(..) {
		let program = &prepared[stage].program;
		match read_status(status, block) {
			Ok(Some(report)) => {
				if let Err(e) = exec_outcome(program, &report) {
					record(failure, e);
				}
			},
			Ok(None) => debug!(program = %program, "exec not reached yet"),
			Err(e) => record(failure, LaunchError::Status(e)),
		}
	}
}

/// Keeps the first failure unless a later one ends the shell. The rest are logged.
fn record(failure: &mut Option<LaunchError>, e: LaunchError) {
	let replace = match *failure {
		None => true,
		Some(ref first) => e.is_fatal() && !first.is_fatal(),
	};
	if !replace {
		warn!("{}", e);
	} else if let Some(previous) = failure.replace(e) {
		warn!("{}", previous);
	}
}

fn run(commands: Vec<Command>, is_background: bool, vars: &Vars, jobs: &JobState) -> Result<(), LaunchError> {
	let prepared = commands.into_iter().map(|c| Prepared::new(c, vars)).collect::<Result<Vec<_>, _>>()?;
	let mask = SigchldBlock::new().map_err(LaunchError::SignalMask)?;
	let mut job = JobBuilder::new(is_background, prepared.len());
	let mut failure: Option<LaunchError> = None;
	let mut upstream: Option<OwnedFd> = None;
	for (i, stage) in prepared.iter().enumerate() {
		let position = Position::of(i, prepared.len());
		let (next_upstream, downstream) = if position.writes_pipe() {
			match unistd::pipe2(OFlag::O_CLOEXEC) {
				Ok((r, w)) => (Some(r), Some(w)),
				Err(e) => {
					record(&mut failure, LaunchError::Pipe(e));
					break;
				},
			}
		} else {
			(None, None)
		};
		debug_assert_eq!(upstream.is_some(), position.reads_pipe());
		let result = spawn(&mut job, i, stage, upstream.as_ref(), downstream.as_ref(), &mask);
		drop(downstream);
		upstream = next_upstream;
		if let Err(e) = result {
			record(&mut failure, e);
			break;
		}
	}
	drop(upstream);

	// A foreground job is waited for first: a child stopped before its exec
	// would otherwise hold the shell in a blocking read.
	let last = job.pids.last().cloned();
	if let (false, Some(pid)) = (is_background, last) {
		jobs.set_foreground(pid);
		drop(mask);
		jobs.wait_foreground(pid);
		collect_statuses(&mut job, &prepared, false, &mut failure);
	} else {
		collect_statuses(&mut job, &prepared, true, &mut failure);
		if let Some(gid) = job.gid {
			debug!(gid = gid.as_raw(), processes = job.pids.len(), "running in background");
		}
	}
	match failure {
		Some(e) => Err(e),
		None => Ok(()),
	}
}

/// Runs one command, waiting for it unless it is a background command.
pub fn launch(command: Command, vars: &Vars, jobs: &JobState) -> Result<(), LaunchError> {
	let is_background = command.is_background;
	run(vec![command], is_background, vars, jobs)
}

/// Runs the stages connected by pipes. Only the last stage is waited for.
pub fn launch_pipeline(commands: Vec<Command>, is_background: bool, vars: &Vars, jobs: &JobState) -> Result<(), LaunchError> {
	if commands.is_empty() {
		return Err(LaunchError::NoArguments);
	}
	run(commands, is_background, vars, jobs)
}
