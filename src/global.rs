use std::io::{self, Write};

use tracing::{debug, warn};

use crate::builtin::{self, Flow};
use crate::eval;
use crate::parser;
use crate::pidset::ProcessSet;
use crate::reap::ReapCoordinator;
use crate::registry::PipeRegistry;
use crate::types::Line;

/// Everything that outlives a single line.
///
/// One per process: the reaping state behind `reaper` is tied to the
/// process-wide SIGCHLD disposition.
pub struct State {
	pub registry: PipeRegistry,
	pub reaper: ReapCoordinator,
	/// Producers of numbered pipes that expired unread.
	pub abandoned: ProcessSet,
}

impl State {
	pub fn new() -> nix::Result<State> {
		let reaper = ReapCoordinator::install()?;
		reaper.arm();
		Ok(State { registry: PipeRegistry::new(), reaper: reaper, abandoned: ProcessSet::new() })
	}

	/// Pids forked by this shell that nobody has waited on yet.
	pub fn tracked(&self) -> usize {
		let deferred: usize = self.registry.iter().map(|e| e.deferred.len()).sum();
		deferred + self.abandoned.len() + self.reaper.tracked()
	}

	pub fn run_line(&mut self, line: &str, out: &mut dyn Write) -> io::Result<Flow> {
		match parser::parse(line) {
			Ok(Line::Empty) => Ok(Flow::Continue),
			Ok(Line::Builtin { name, arguments }) => {
				eval::pass(self);
				match builtin::match_builtin(&name) {
					Some(builtin) => builtin(&arguments, out),
					None => Ok(Flow::Continue),
				}
			},
			Ok(Line::Pipeline(pipeline)) => {
				let report = eval::eval(self, pipeline);
				debug!(launched = report.launched.len(), waited = report.waited.len(), deferred_to = ?report.deferred_to, "line done");
				Ok(Flow::Continue)
			},
			Err(e) => {
				warn!(error = %e, "parse error");
				eprintln!("parse error: {}", e);
				Ok(Flow::Continue)
			},
		}
	}
}
