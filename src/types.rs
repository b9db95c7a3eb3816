use std::path::PathBuf;

/// Which output streams of a stage feed a numbered pipe.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Stream { Stdout, Both }

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Sink {
	None,
	OrdinaryPipe,
	NumberedPipe { count: i32, stream: Stream },
	FileRedirect { path: PathBuf },
}

impl Sink {
	pub fn numbered_key(&self) -> Option<i32> {
		match *self {
			Sink::NumberedPipe { count, .. } => Some(count),
			_ => None,
		}
	}
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Stage {
	pub name: String,
	pub arguments: Vec<String>,
	pub sink: Sink,
}

impl Stage {
	pub fn new(name: &str, arguments: &[&str], sink: Sink) -> Stage {
		Stage {
			name: name.to_owned(),
			arguments: arguments.iter().map(|&s| s.to_owned()).collect(),
			sink: sink,
		}
	}
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Pipeline {
	pub stages: Vec<Stage>,
}

impl Pipeline {
	/// Sink of the final stage; decides whether an invocation drains or defers.
	pub fn last_sink(&self) -> Option<&Sink> {
		self.stages.last().map(|s| &s.sink)
	}
}

/// One parsed input line.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Line {
	Empty,
	Builtin { name: String, arguments: Vec<String> },
	Pipeline(Pipeline),
}
