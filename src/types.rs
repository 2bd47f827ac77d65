use crate::parser::ParseError;

pub const REDIRECT_TOKEN: &str = ">";

/// One process worth of arguments, `argv[0]` being the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
	pub argv: Vec<String>,
	pub is_background: bool,
}

/// Outcome of parsing one command string. Exactly one is produced per call.
#[derive(Debug, PartialEq, Eq)]
pub enum Directive {
	Runnable(Command),
	/// The store was already updated.
	VariableAssignment,
	ExitRequested,
	ResumeBackgroundRequested,
	ParseError(ParseError),
	AllocationFailure,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Redirect {
	/// Destination token as written; may still be a `$name` reference.
	pub target: String,
}

impl Redirect {
	/// Takes the output redirection out of `argv`.
	///
	/// The last `>` past the program name that is followed by another argument
	/// wins. Everything from that `>` on is removed from `argv`.
	pub fn extract(argv: &mut Vec<String>) -> Option<Redirect> {
		if argv.len() < 2 {
			return None;
		}
		let at = argv[.. argv.len() - 1].iter().rposition(|a| a == REDIRECT_TOKEN)?;
		if at == 0 {
			return None;
		}
		let target = argv.drain(at ..).nth(1)?;
		Some(Redirect { target: target })
	}
}

#[derive(Debug, PartialEq, Eq)]
pub struct Pipeline<'a> {
	pub stages: Vec<&'a str>,
	pub is_background: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position { Only, First, Middle, Last }

impl Position {
	pub fn of(i: usize, len: usize) -> Position {
		match (i == 0, i + 1 == len) {
			(true, true) => Position::Only,
			(true, false) => Position::First,
			(false, true) => Position::Last,
			(false, false) => Position::Middle,
		}
	}

	pub fn reads_pipe(self) -> bool {
		match self {
			Position::Middle | Position::Last => true,
			_ => false,
		}
	}

	pub fn writes_pipe(self) -> bool {
		match self {
			Position::First | Position::Middle => true,
			_ => false,
		}
	}
}
