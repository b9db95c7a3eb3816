use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Clone, Parser)]
#[command(
	name = "npsh",
	version,
	about = "A shell with numbered pipes that carry output across command lines.",
	long_about = None
)]
pub struct CliArgs {
	/// Prompt printed before each line.
	#[arg(long, value_name = "STR", default_value = "% ")]
	pub prompt: String,

	/// Do not print a prompt (for scripted input).
	#[arg(long)]
	pub no_prompt: bool,

	/// Initial value of PATH.
	#[arg(long, value_name = "PATH")]
	pub path: Option<String>,

	/// Logging level (off, error, warn, info, debug, trace).
	///
	/// If omitted, `NPSH_LOG` or `warn` is used.
	#[arg(long, value_name = "LEVEL")]
	pub log_level: Option<LevelFilter>,
}

pub fn parse() -> CliArgs {
	CliArgs::parse()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		let args = CliArgs::parse_from(["npsh"]);
		assert_eq!(args.prompt, "% ");
		assert!(!args.no_prompt);
		assert!(args.path.is_none());
		assert!(args.log_level.is_none());
	}

	#[test]
	fn flags() {
		let args = CliArgs::parse_from(["npsh", "--no-prompt", "--path", "bin:.", "--log-level", "debug"]);
		assert!(args.no_prompt);
		assert_eq!(args.path.as_deref(), Some("bin:."));
		assert_eq!(args.log_level, Some(LevelFilter::DEBUG));
	}

	#[test]
	fn unknown_level_is_rejected() {
		assert!(CliArgs::try_parse_from(["npsh", "--log-level", "loud"]).is_err());
	}
}
