//! Diagnostics go to stderr so they never mix with pipeline output.
//!
//! Filter: `--log-level`, then `NPSH_LOG` (full `EnvFilter` directives),
//! then `warn`.

use anyhow::Result;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt;

fn filter(cli_level: Option<LevelFilter>) -> EnvFilter {
	match cli_level {
		Some(level) => EnvFilter::new(level.to_string()),
		None => EnvFilter::builder()
			.with_default_directive(LevelFilter::WARN.into())
			.with_env_var("NPSH_LOG")
			.from_env_lossy(),
	}
}

pub fn init_logging(cli_level: Option<LevelFilter>) -> Result<()> {
	fmt()
		.with_env_filter(filter(cli_level))
		.with_writer(std::io::stderr)
		.with_target(false)
		.without_time()
		.try_init()
		.map_err(|e| anyhow::anyhow!(e))?;

	Ok(())
}
