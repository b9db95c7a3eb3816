use std::convert::Infallible;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::io::OwnedFd;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{self, Pid};
use tracing::{debug, warn};

use crate::error::{ExecError, Result, ShellError};
use crate::global;
use crate::pidset::ProcessSet;
use crate::reap::{Forked, ReapCoordinator, WaitStatusExt};
use crate::registry::{PipeRegistry, ORIGIN_KEY};
use crate::types::{Pipeline, Sink, Stage, Stream};

/// Where a stage's stdin comes from.
#[derive(Debug)]
enum Input {
	Inherit,
	/// Read end of the key-0 numbered pipe.
	Origin,
	Pipe(OwnedFd),
}

/// Where a stage's stdout goes.
#[derive(Debug)]
enum Output {
	Inherit,
	Pipe(OwnedFd),
	Numbered { key: i32, stream: Stream },
	File(OwnedFd),
}

/// What one line did with its children.
#[derive(Debug, Default)]
pub struct Report {
	pub launched: Vec<Pid>,
	/// Statuses collected by the synchronous drain. Children reaped by the
	/// SIGCHLD handler do not appear here.
	pub waited: Vec<WaitStatus>,
	/// Numbered pipe that took over the wait, if the line ended in one.
	pub deferred_to: Option<i32>,
}

fn resolve_sink(registry: &mut PipeRegistry, sink: &Sink) -> Result<(Output, Option<OwnedFd>)> {
	match *sink {
		Sink::None => Ok((Output::Inherit, None)),
		Sink::OrdinaryPipe => {
			let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(ShellError::ResourceExhausted)?;
			Ok((Output::Pipe(write), Some(read)))
		},
		Sink::NumberedPipe { count, stream } => {
			registry.find_or_insert(count)?;
			Ok((Output::Numbered { key: count, stream: stream }, None))
		},
		Sink::FileRedirect { ref path } => {
			let file = fs::OpenOptions::new().write(true).create(true).truncate(true).open(path)
				.map_err(|e| ShellError::Redirect { path: path.clone(), source: e })?;
			Ok((Output::File(OwnedFd::from(file)), None))
		},
	}
}

fn build_argv(stage: &Stage) -> Result<Vec<CString>> {
	let mut argv = Vec::with_capacity(stage.arguments.len() + 1);
	argv.push(CString::new(stage.name.as_str())?);
	for arg in &stage.arguments {
		argv.push(CString::new(arg.as_str())?);
	}
	Ok(argv)
}

fn do_exec_stage(registry: &mut PipeRegistry, input: &Input, output: &Output, argv: &[CString]) -> std::result::Result<Infallible, ExecError> {
	let own_key = match *output {
		Output::Numbered { key, .. } => Some(key),
		_ => None,
	};
	registry.close_all_write_ends(own_key);
	// Rust starts with SIGPIPE ignored, and ignored dispositions survive exec.
	unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) }.map_err(ExecError::Wire)?;

	match *input {
		Input::Inherit => {},
		Input::Origin => {
			if let Some(fd) = registry.find(ORIGIN_KEY).and_then(|e| e.read_end()) {
				unistd::dup2_stdin(fd).map_err(ExecError::Wire)?;
			}
		},
		Input::Pipe(ref fd) => unistd::dup2_stdin(fd).map_err(ExecError::Wire)?,
	}

	match *output {
		Output::Inherit => {},
		Output::Pipe(ref fd) | Output::File(ref fd) => unistd::dup2_stdout(fd).map_err(ExecError::Wire)?,
		Output::Numbered { key, stream } => {
			let fd = registry.find(key).and_then(|e| e.write_end()).ok_or(ExecError::Wire(Errno::EBADF))?;
			unistd::dup2_stdout(fd).map_err(ExecError::Wire)?;
			if stream == Stream::Both {
				unistd::dup2_stderr(fd).map_err(ExecError::Wire)?;
			}
		},
	}

	let name = argv[0].to_string_lossy().into_owned();
	match unistd::execvp(&argv[0], argv) {
		Ok(never) => match never {},
		Err(Errno::ENOENT) => Err(ExecError::NotFound(name)),
		Err(e) => Err(ExecError::Exec { name: name, source: e }),
	}
}

fn exec_stage(registry: &mut PipeRegistry, input: &Input, output: &Output, argv: &[CString]) -> ! {
	let e = match do_exec_stage(registry, input, output, argv) {
		Ok(never) => match never {},
		Err(e) => e,
	};
	let msg = format!("{}\n", e);
	let _ = unistd::write(io::stderr(), msg.as_bytes());
	unsafe { libc::_exit(e.code()) }
}

/// Arms the handler with room for every pid it could record: the
/// `upcoming` stages plus everything the shell still tracks.
fn arm(state: &global::State, upcoming: usize) {
	state.reaper.reserve(upcoming + state.tracked());
	state.reaper.arm();
}

fn fork_stage(state: &mut global::State, stage: &Stage) -> Result<Forked> {
	fork_stage_with(state, stage, |reaper| reaper.fork())
}

/// Forks one stage, recovering from fork failure by reaping a child and
/// retrying. Gives up only when there is no child left to reap.
fn fork_stage_with<F>(state: &mut global::State, stage: &Stage, mut fork: F) -> Result<Forked>
	where F: FnMut(&ReapCoordinator) -> nix::Result<Forked>
{
	loop {
		let err = match fork(&state.reaper) {
			Ok(forked) => return Ok(forked),
			Err(e) => e,
		};
		warn!(stage = %stage.name, error = %err, "fork failed, reaping a child before retrying");
		state.reaper.disarm();
		let reaped = state.reaper.reap_any();
		state.reaper.arm();
		if let Err(e) = reaped {
			debug!(error = %e, "nothing to reap");
			return Err(ShellError::Fork(err));
		}
	}
}

/// The kernel handed out a pid whose previous owner is still listed in a
/// deferred or abandoned set. That owner is already reaped; forget its one
/// listing.
fn forget_recycled(state: &mut global::State, pid: Pid) {
	debug!(%pid, "recycled pid");
	if state.abandoned.remove_exact(pid) {
		return;
	}
	for deferred in state.registry.deferred_mut() {
		if deferred.remove_exact(pid) {
			return;
		}
	}
}

fn spawn_stages(state: &mut global::State, pipeline: Pipeline) -> Vec<Pid> {
	let mut launched = Vec::with_capacity(pipeline.stages.len());
	let mut input = if state.registry.find(ORIGIN_KEY).is_some() { Input::Origin } else { Input::Inherit };

	for stage in pipeline.stages {
		let prepared = build_argv(&stage).and_then(|argv| {
			let (output, next) = resolve_sink(&mut state.registry, &stage.sink)?;
			Ok((output, next, argv))
		});
		let (output, next, argv) = match prepared {
			Ok(p) => p,
			Err(e) => {
				warn!(stage = %stage.name, error = %e, "skipping stage");
				eprintln!("npsh: {}: {}", stage.name, e);
				input = Input::Inherit;
				continue;
			},
		};

		match fork_stage(state, &stage) {
			Ok(Forked::Child) => exec_stage(&mut state.registry, &input, &output, &argv),
			Ok(Forked::Parent { child, recycled }) => {
				debug!(%child, stage = %stage.name, "forked");
				if recycled {
					forget_recycled(state, child);
				}
				launched.push(child);
			},
			Err(e) => {
				warn!(stage = %stage.name, error = %e, "skipping stage");
				eprintln!("npsh: {}: {}", stage.name, e);
			},
		}

		// The parent's copies of consumed ends close here.
		drop(output);
		input = match next {
			Some(read) => Input::Pipe(read),
			None => Input::Inherit,
		};
	}
	launched
}

fn drain(state: &mut global::State, mut pids: ProcessSet) -> Vec<WaitStatus> {
	state.reaper.reconcile(&mut pids);
	let mut waited = Vec::with_capacity(pids.len());
	for pid in pids {
		match state.reaper.wait_for(pid) {
			Ok(status) => {
				debug!(%pid, code = status.code(), "waited");
				waited.push(status);
			},
			Err(e) => warn!(%pid, error = %e, "child vanished before it was waited on"),
		}
	}
	waited
}

/// Starts a new line: counts every numbered pipe down and collects any
/// producers of expired pipes that have since exited.
fn advance(state: &mut global::State) {
	let mut expired = state.registry.advance();
	state.abandoned.merge(&mut expired);
	if state.abandoned.is_empty() {
		return;
	}

	state.reaper.disarm();
	state.reaper.reconcile(&mut state.abandoned);
	for pid in state.abandoned.take() {
		match state.reaper.try_wait(pid) {
			Ok(None) => { state.abandoned.insert(pid); },
			Ok(Some(status)) => debug!(%pid, code = status.code(), "collected abandoned producer"),
			Err(e) => warn!(%pid, error = %e, "abandoned producer vanished"),
		}
	}
	arm(state, 0);
}

/// Consumes a line that runs no pipeline. The line still counts toward
/// every numbered pipe, and whatever was queued for it is released.
pub fn pass(state: &mut global::State) {
	advance(state);
	if let Some(mut origin) = state.registry.remove(ORIGIN_KEY) {
		state.abandoned.merge(&mut origin.deferred);
	}
}

pub fn eval(state: &mut global::State, pipeline: Pipeline) -> Report {
	advance(state);
	let target = match pipeline.last_sink() {
		Some(&Sink::NumberedPipe { count, .. }) => Some(count),
		_ => None,
	};

	arm(state, pipeline.stages.len());
	let launched = spawn_stages(state, pipeline);
	state.reaper.disarm();

	let mut pids = state.reaper.take_live();
	// Dropping the shell's ends of the origin pipe lets its reader see EOF.
	if let Some(mut origin) = state.registry.remove(ORIGIN_KEY) {
		pids.merge(&mut origin.deferred);
	}

	let mut report = Report { launched: launched, waited: vec![], deferred_to: None };
	match target.filter(|&key| state.registry.find(key).is_some()) {
		Some(key) => {
			state.reaper.reconcile(&mut pids);
			if let Some(entry) = state.registry.find_mut(key) {
				entry.deferred.merge(&mut pids);
			}
			debug!(key, "wait deferred to numbered pipe");
			report.deferred_to = Some(key);
		},
		None => report.waited = drain(state, pids),
	}

	arm(state, 0);
	report
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::process::Command;
	use std::sync::PoisonError;

	use crate::reap::CHILD_TESTS;

	fn stage() -> Stage {
		Stage::new("true", &[], Sink::None)
	}

	#[test]
	fn failed_fork_reaps_a_child_and_retries() {
		let _g = CHILD_TESTS.lock().unwrap_or_else(PoisonError::into_inner);
		let mut state = global::State::new().unwrap();
		let mut spare: ProcessSet = (0 .. 2)
			.map(|_| Command::new("true").spawn().unwrap())
			.map(|child| Pid::from_raw(child.id() as i32))
			.collect();
		let fake = Pid::from_raw(i32::MAX);

		let mut calls = 0;
		let forked = fork_stage_with(&mut state, &stage(), |reaper| {
			assert!(reaper.is_armed());
			calls += 1;
			if calls <= 2 {
				Err(Errno::EAGAIN)
			} else {
				Ok(Forked::Parent { child: fake, recycled: false })
			}
		}).unwrap();

		assert_eq!(forked, Forked::Parent { child: fake, recycled: false });
		assert_eq!(calls, 3);
		assert!(state.reaper.is_armed());
		// Each retry consumed one of the spare children.
		state.reaper.reconcile(&mut spare);
		assert!(spare.is_empty());
	}

	#[test]
	fn failed_fork_gives_up_without_children() {
		let _g = CHILD_TESTS.lock().unwrap_or_else(PoisonError::into_inner);
		let mut state = global::State::new().unwrap();

		let mut calls = 0;
		let result = fork_stage_with(&mut state, &stage(), |_| {
			calls += 1;
			Err(Errno::EAGAIN)
		});

		assert!(matches!(result, Err(ShellError::Fork(Errno::EAGAIN))));
		assert_eq!(calls, 1);
		assert!(state.reaper.is_armed());
	}

	#[test]
	fn recycled_pid_loses_exactly_one_listing() {
		let mut state = global::State::new().unwrap();
		let pid = Pid::from_raw(4242);
		let other = Pid::from_raw(4243);
		state.registry.insert(2).unwrap().deferred.insert(pid);
		state.registry.insert(5).unwrap().deferred.insert(other);

		forget_recycled(&mut state, pid);
		assert!(!state.registry.find(2).unwrap().deferred.contains(pid));
		assert!(state.registry.find(5).unwrap().deferred.contains(other));

		state.abandoned.insert(pid);
		state.registry.find_mut(2).unwrap().deferred.insert(pid);
		forget_recycled(&mut state, pid);
		let listings = state.abandoned.iter()
			.chain(state.registry.iter().flat_map(|e| e.deferred.iter()))
			.filter(|&&p| p == pid)
			.count();
		assert_eq!(listings, 1);
		assert!(!state.abandoned.contains(pid));
	}
}
