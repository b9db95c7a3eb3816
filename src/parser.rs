use std::path::PathBuf;

use crate::builtin;
use crate::error::ParseError;
use crate::types::*;

type ParseResult<T> = Result<T, ParseError>;

struct Parser<'a> {
	line: &'a str,
	i: usize,
}

impl<'a> Parser<'a> {
	fn proceed_while<F>(&mut self, f: F) where F: Fn(u8) -> bool {
		while let Some(c) = self.line.as_bytes().get(self.i) {
			if !f(*c) { break; }
			self.i += 1;
		}
	}

	fn is_whitespace(c: u8) -> bool {
		match c {
			b' ' | b'\t' | b'\r' | b'\n' => true,
			_ => false,
		}
	}

	fn is_letter(c: u8) -> bool {
		!Parser::is_whitespace(c)
	}

	fn is_symbol(c: u8) -> bool {
		match c {
			b'>' | b'|' | b'!' => true,
			_ => false,
		}
	}

	fn is_name_char(c: u8) -> bool {
		c.is_ascii_alphanumeric() || c == b'.' || c == b'/' || c == b'_'
	}

	fn skip_whitespaces(&mut self) {
		self.proceed_while(Parser::is_whitespace);
	}

	fn peek(&self) -> Option<u8> {
		self.line.as_bytes().get(self.i).cloned()
	}

	fn read_word(&mut self) -> &'a str {
		let orig = self.i;
		self.proceed_while(Parser::is_letter);
		&self.line[orig .. self.i]
	}

	fn read_name(&mut self) -> ParseResult<&'a str> {
		let name = self.read_word();
		match name.as_bytes().first() {
			Some(c) if !c.is_ascii_alphanumeric() => Err(ParseError::UnexpectedSymbol(name.to_owned())),
			_ if !name.bytes().all(Parser::is_name_char) => Err(ParseError::InvalidProgramName(name.to_owned())),
			_ => Ok(name),
		}
	}

	fn pipe_number(symbol: &str) -> ParseResult<i32> {
		match symbol[1 ..].parse::<i32>() {
			Ok(n) if n > 0 => Ok(n),
			_ => Err(ParseError::BadPipeNumber(symbol.to_owned())),
		}
	}

	fn parse_sink(&mut self) -> ParseResult<Sink> {
		let symbol = self.read_word();
		match symbol.as_bytes()[0] {
			b'>' if symbol.len() == 1 => {
				self.skip_whitespaces();
				let target = self.read_word();
				if target.is_empty() {
					return Err(ParseError::MissingRedirectTarget);
				}
				Ok(Sink::FileRedirect { path: PathBuf::from(target) })
			},
			b'|' if symbol.len() == 1 => Ok(Sink::OrdinaryPipe),
			b'|' => Ok(Sink::NumberedPipe { count: Parser::pipe_number(symbol)?, stream: Stream::Stdout }),
			b'!' => Ok(Sink::NumberedPipe { count: Parser::pipe_number(symbol)?, stream: Stream::Both }),
			_ => Err(ParseError::UnexpectedSymbol(symbol.to_owned())),
		}
	}

	fn parse_stage(&mut self) -> ParseResult<Stage> {
		let name = self.read_name()?;
		let mut arguments: Vec<String> = vec![];

		loop {
			self.skip_whitespaces();
			match self.peek() {
				None => return Ok(Stage { name: name.to_owned(), arguments: arguments, sink: Sink::None }),
				Some(c) if Parser::is_symbol(c) => break,
				Some(_) => arguments.push(self.read_word().to_owned()),
			}
		}

		let sink = self.parse_sink()?;
		Ok(Stage { name: name.to_owned(), arguments: arguments, sink: sink })
	}

	fn parse_pipeline(&mut self) -> ParseResult<Pipeline> {
		let mut stages: Vec<Stage> = vec![];

		loop {
			let stage = self.parse_stage()?;
			let piped = stage.sink == Sink::OrdinaryPipe;
			stages.push(stage);
			self.skip_whitespaces();
			if self.peek().is_none() {
				if piped {
					return Err(ParseError::MissingCommand);
				}
				break;
			}
		}
		Ok(Pipeline { stages: stages })
	}

	fn parse_line(&mut self) -> ParseResult<Line> {
		self.skip_whitespaces();
		if self.peek().is_none() {
			return Ok(Line::Empty);
		}

		let orig = self.i;
		let first = self.read_word();
		if builtin::is_builtin(first) {
			let mut arguments: Vec<String> = vec![];
			loop {
				self.skip_whitespaces();
				let word = self.read_word();
				if word.is_empty() { break; }
				arguments.push(word.to_owned());
			}
			return Ok(Line::Builtin { name: first.to_owned(), arguments: arguments });
		}

		self.i = orig;
		Ok(Line::Pipeline(self.parse_pipeline()?))
	}
}

pub fn parse(line: &str) -> ParseResult<Line> {
	let mut parser = Parser { line: line, i: 0 };
	parser.parse_line()
}
