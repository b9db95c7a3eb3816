use std::env;
use std::io;
use std::io::{BufRead, Write};

use anyhow::Context;
use npsh::{cli, logging, Flow, State};

fn main() {
	if let Err(err) = run_main() {
		eprintln!("npsh: {:?}", err);
		std::process::exit(1);
	}
}

fn run_main() -> anyhow::Result<()> {
	let args = cli::parse();
	logging::init_logging(args.log_level)?;
	if let Some(ref path) = args.path {
		env::set_var("PATH", path);
	}

	let mut state = State::new().context("installing SIGCHLD handler")?;
	let mut stdout = io::stdout();
	let stdin = io::stdin();
	let mut stdin_locked = stdin.lock();
	let mut line = String::new();
	loop {
		if !args.no_prompt {
			stdout.write_all(args.prompt.as_bytes())?;
			stdout.flush()?;
		}
		line.clear();
		if stdin_locked.read_line(&mut line)? == 0 {
			break;
		}
		if state.run_line(&line, &mut stdout)? == Flow::Exit {
			break;
		}
	}
	Ok(())
}
