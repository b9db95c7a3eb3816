use std::env;
use std::io::{self, Write};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Flow { Continue, Exit }

pub type Builtin = fn(&[String], &mut dyn Write) -> io::Result<Flow>;

fn usage(msg: &str) -> io::Result<Flow> {
	eprintln!("usage: {}", msg);
	Ok(Flow::Continue)
}

pub fn builtin_setenv(args: &[String], _: &mut dyn Write) -> io::Result<Flow> {
	match args {
		[name, value] if !name.is_empty() && !name.contains('=') => {
			env::set_var(name, value);
			Ok(Flow::Continue)
		},
		_ => usage("setenv NAME VALUE"),
	}
}

pub fn builtin_printenv(args: &[String], out: &mut dyn Write) -> io::Result<Flow> {
	match args {
		[name] => {
			if let Some(value) = env::var_os(name) {
				use std::os::unix::ffi::OsStrExt;
				out.write_all(value.as_bytes())?;
				out.write_all(b"\n")?;
				out.flush()?;
			}
			Ok(Flow::Continue)
		},
		_ => usage("printenv NAME"),
	}
}

pub fn builtin_exit(_: &[String], _: &mut dyn Write) -> io::Result<Flow> {
	Ok(Flow::Exit)
}

pub fn match_builtin(name: &str) -> Option<Builtin> {
	match name {
		"setenv" => Some(builtin_setenv),
		"printenv" => Some(builtin_printenv),
		"exit" => Some(builtin_exit),
		_ => None,
	}
}

pub fn is_builtin(name: &str) -> bool {
	match_builtin(name).is_some()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn run(name: &str, args: &[&str]) -> (Flow, Vec<u8>) {
		let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
		let mut out: Vec<u8> = vec![];
		let flow = match_builtin(name).unwrap()(&args, &mut out).unwrap();
		(flow, out)
	}

	#[test]
	fn setenv_then_printenv() {
		assert_eq!(run("printenv", &["NPSH_BUILTIN_TEST"]), (Flow::Continue, vec![]));
		assert_eq!(run("setenv", &["NPSH_BUILTIN_TEST", "bar"]).0, Flow::Continue);
		assert_eq!(run("printenv", &["NPSH_BUILTIN_TEST"]), (Flow::Continue, b"bar\n".to_vec()));
	}

	#[test]
	fn bad_arity_is_not_fatal() {
		assert_eq!(run("setenv", &["ONLY_NAME"]), (Flow::Continue, vec![]));
		assert_eq!(run("printenv", &[]), (Flow::Continue, vec![]));
		assert!(env::var_os("ONLY_NAME").is_none());
	}

	#[test]
	fn exit_stops_the_loop() {
		assert_eq!(run("exit", &[]).0, Flow::Exit);
		assert!(match_builtin("cd").is_none());
	}
}
