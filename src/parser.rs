use thiserror::Error;

use crate::config::Limits;
use crate::job::JobState;
use crate::scanner::Scanner;
use crate::types::{Command, Directive, REDIRECT_TOKEN};
use crate::vars::{self, StoreError, Vars};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
	#[error("empty command")]
	Blank,
	#[error("no arguments")]
	NoArguments,
	#[error("assign in this pattern: <variable name>=<value>")]
	AssignmentPattern,
	#[error("there is no command {0}")]
	SpacedAssignment(String),
	#[error("ambiguous use of '=' in assignment to {0}")]
	AmbiguousAssignment(String),
	#[error("the value of {0} can't contain '>'")]
	RedirectInValue(String),
	#[error("maximum number of environment variables exceeded")]
	TooManyVariables,
	#[error("too many arguments")]
	TooManyArguments,
	#[error("Error: Too many words in input string")]
	TooManyWords,
	#[error("Error: Unbalanced quotes in input string")]
	UnbalancedQuotes,
	#[error("{0} isn't assigned")]
	Unassigned(String),
	#[error("cd not supported")]
	CdUnsupported,
	#[error("enter source & dest")]
	MissingRedirectOperand,
	#[error("no stopped process to resume")]
	NothingToResume,
	#[error("{0}: not allowed in a pipeline")]
	NotRunnable(String),
	#[error("malloc failed")]
	OutOfMemory,
}

impl ParseError {
	/// Errors the user is not told about.
	pub fn is_silent(&self) -> bool {
		match *self {
			ParseError::Blank | ParseError::NothingToResume => true,
			_ => false,
		}
	}
}

impl From<StoreError> for ParseError {
	fn from(e: StoreError) -> ParseError {
		match e {
			StoreError::Capacity => ParseError::TooManyVariables,
			StoreError::OutOfMemory => ParseError::OutOfMemory,
		}
	}
}

type ParseResult<T> = Result<T, ParseError>;

fn own(s: &str) -> ParseResult<String> {
	vars::try_own(s).map_err(|_| ParseError::OutOfMemory)
}

pub struct Parser<'s> {
	vars: &'s mut Vars,
	jobs: &'s JobState,
	limits: Limits,
}

impl<'s> Parser<'s> {
	pub fn new(vars: &'s mut Vars, jobs: &'s JobState, limits: Limits) -> Parser<'s> {
		Parser { vars: vars, jobs: jobs, limits: limits }
	}

	pub fn parse(&mut self, command: &str) -> Directive {
		match self.parse_command(command) {
			Ok(directive) => directive,
			Err(ParseError::OutOfMemory) => Directive::AllocationFailure,
			Err(e) => Directive::ParseError(e),
		}
	}

	fn parse_command(&mut self, command: &str) -> ParseResult<Directive> {
		if command.contains('=') && !command.starts_with("echo") {
			self.assign(command)?;
			return Ok(Directive::VariableAssignment);
		}

		let mut tokens = Scanner::new(command);
		let first = tokens.field(b' ').ok_or(ParseError::Blank)?;
		let mut argv = match first {
			"exit" => return Ok(Directive::ExitRequested),
			"echo" => self.echo_words(command)?,
			"bg" => return self.resume(&mut tokens),
			_ => self.words(first, &mut tokens)?,
		};

		let is_background = strip_background(&mut argv);
		if argv.is_empty() {
			return Err(ParseError::NoArguments);
		}
		let dangling = |a: Option<&String>| a.map_or(false, |a| a == REDIRECT_TOKEN);
		if dangling(argv.first()) || dangling(argv.last()) {
			return Err(ParseError::MissingRedirectOperand);
		}
		Ok(Directive::Runnable(Command { argv: argv, is_background: is_background }))
	}

	fn assign(&mut self, command: &str) -> ParseResult<()> {
		let (name, value) = split_assignment(command)?;
		self.vars.set(&name, &value)?;
		Ok(())
	}

	fn resume(&self, tokens: &mut Scanner<'_>) -> ParseResult<Directive> {
		if tokens.field(b' ').is_none() && self.jobs.stopped_is_alive() {
			Ok(Directive::ResumeBackgroundRequested)
		} else {
			Err(ParseError::NothingToResume)
		}
	}

	fn new_argv(&self) -> ParseResult<Vec<String>> {
		let mut argv = Vec::new();
		argv.try_reserve_exact(self.limits.max_args + 3).map_err(|_| ParseError::OutOfMemory)?;
		Ok(argv)
	}

	fn words(&self, first: &str, tokens: &mut Scanner<'_>) -> ParseResult<Vec<String>> {
		let mut argv = self.new_argv()?;
		let mut token = Some(first);
		while let Some(t) = token {
			let word = match t.strip_prefix('$') {
				Some(name) => self.vars.get(name).ok_or_else(|| ParseError::Unassigned(name.to_string()))?,
				None => t,
			};
			if word == "cd" {
				return Err(ParseError::CdUnsupported);
			}
			if word != " " {
				split_redirect(word, &mut argv)?;
				if argv.len() > self.limits.max_args {
					return Err(ParseError::TooManyArguments);
				}
			}
			token = tokens.field(b' ');
		}
		Ok(argv)
	}

	fn echo_words(&self, command: &str) -> ParseResult<Vec<String>> {
		let mut argv = self.new_argv()?;
		let mut words = Scanner::new(command);
		let mut in_quotes = false;
		while let Some(raw) = words.echo_word(&mut in_quotes) {
			if raw.is_empty() {
				continue;
			}
			let word = remove_quotes(&self.expand_echo_word(raw)?)?;
			split_redirect(&word, &mut argv)?;
			if argv.len() > self.limits.max_args {
				return Err(ParseError::TooManyWords);
			}
		}
		if in_quotes {
			return Err(ParseError::UnbalancedQuotes);
		}
		Ok(argv)
	}

	/// `$name` becomes the variable's value, with anything from the first quote
	/// on appended as written. Unknown names become a single space.
	fn expand_echo_word(&self, raw: &str) -> ParseResult<String> {
		let bytes = raw.as_bytes();
		if bytes.len() < 2 || bytes[0] != b'$' || bytes[1] == b'"' || bytes[1] == b' ' {
			return own(raw);
		}
		let name_end = raw.find('"').unwrap_or(raw.len());
		match self.vars.get(&raw[1 .. name_end]) {
			Some(value) => {
				let rest = &raw[name_end ..];
				let mut word = String::new();
				word.try_reserve_exact(value.len() + rest.len()).map_err(|_| ParseError::OutOfMemory)?;
				word.push_str(value);
				word.push_str(rest);
				Ok(word)
			},
			None => own(" "),
		}
	}
}

/// Redirection splitter: breaks `word` at its first `>` into up to three
/// arguments, the text before it, `>` itself and the text after it.
pub fn split_redirect(word: &str, argv: &mut Vec<String>) -> ParseResult<()> {
	match word.find('>') {
		None => argv.push(own(word)?),
		Some(at) => {
			let (before, after) = (&word[.. at], &word[at + 1 ..]);
			if !before.is_empty() {
				argv.push(own(before)?);
			}
			argv.push(own(REDIRECT_TOKEN)?);
			if !after.is_empty() {
				argv.push(own(after)?);
			}
		},
	}
	Ok(())
}

/// Removes a trailing `&` argument, or a `&` glued to the last argument.
fn strip_background(argv: &mut Vec<String>) -> bool {
	let last = match argv.last_mut() {
		Some(last) => last,
		None => return false,
	};
	if last.as_str() == "&" {
		argv.pop();
		true
	} else if last.ends_with('&') {
		last.pop();
		true
	} else {
		false
	}
}

fn split_assignment(command: &str) -> ParseResult<(String, String)> {
	let at = command.find('=').ok_or(ParseError::AssignmentPattern)?;
	let name = command[.. at].trim_start_matches(' ');
	let value = &command[at + 1 ..];
	if name.is_empty() || value.is_empty() {
		return Err(ParseError::AssignmentPattern);
	}
	if name.chars().skip(1).any(|c| c == ' ') || value.starts_with(' ') {
		return Err(ParseError::SpacedAssignment(name.trim_end().to_string()));
	}
	if value.contains('=') {
		return Err(ParseError::AmbiguousAssignment(name.to_string()));
	}
	if value.contains('>') {
		return Err(ParseError::RedirectInValue(name.to_string()));
	}
	Ok((squeeze(name)?, squeeze(value)?))
}

/// Drops quotes and collapses runs of spaces, without a trailing space.
fn squeeze(s: &str) -> ParseResult<String> {
	let mut out = String::new();
	out.try_reserve_exact(s.len()).map_err(|_| ParseError::OutOfMemory)?;
	let mut before = ' ';
	for c in s.chars() {
		if (c != ' ' || before != ' ') && c != '"' {
			out.push(c);
		}
		before = c;
	}
	if out.ends_with(' ') {
		out.pop();
	}
	Ok(out)
}

fn remove_quotes(s: &str) -> ParseResult<String> {
	let mut out = String::new();
	out.try_reserve_exact(s.len()).map_err(|_| ParseError::OutOfMemory)?;
	out.extend(s.chars().filter(|&c| c != '"'));
	Ok(out)
}
