use std::{ffi, io};
use std::path::PathBuf;

use thiserror::Error;

/// A malformed line. Nothing from the line is executed.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum ParseError {
	#[error("unexpected symbol '{0}'")]
	UnexpectedSymbol(String),
	#[error("invalid program name '{0}'")]
	InvalidProgramName(String),
	#[error("invalid pipe number in '{0}'")]
	BadPipeNumber(String),
	#[error("missing redirect target")]
	MissingRedirectTarget,
	#[error("missing command after '|'")]
	MissingCommand,
}

#[derive(Debug, Error)]
pub enum ShellError {
	#[error("cannot create pipe: {0}")]
	ResourceExhausted(#[source] nix::Error),
	#[error("cannot open {}: {source}", .path.display())]
	Redirect { path: PathBuf, #[source] source: io::Error },
	#[error("fork failed: {0}")]
	Fork(#[source] nix::Error),
	#[error("argument contains a nul byte: {0}")]
	Nul(#[from] ffi::NulError),
}

pub type Result<T> = std::result::Result<T, ShellError>;

/// Failures inside a forked child before its program image is replaced.
#[derive(Debug, Error)]
pub enum ExecError {
	#[error("{0}")]
	Wire(#[source] nix::Error),
	#[error("Unknown command: [{0}].")]
	NotFound(String),
	#[error("{name}: {source}")]
	Exec { name: String, #[source] source: nix::Error },
}

impl ExecError {
	/// Exit status of the child: the OS error code behind the failure.
	pub fn code(&self) -> i32 {
		match *self {
			ExecError::Wire(e) => e as i32,
			ExecError::NotFound(_) => nix::errno::Errno::ENOENT as i32,
			ExecError::Exec { source, .. } => source as i32,
		}
	}
}
