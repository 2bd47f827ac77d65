#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
	/// Largest argument vector a single command may produce.
	pub max_args: usize,
	/// Longest accepted input line, newline excluded.
	pub max_line: usize,
	/// Number of distinct shell variables the store holds.
	pub max_vars: usize,
	/// Consecutive empty lines that end the session.
	pub blank_lines_to_exit: usize,
}

impl Default for Limits {
	fn default() -> Limits {
		Limits {
			max_args: 10,
			max_line: 510,
			max_vars: 100,
			blank_lines_to_exit: 3,
		}
	}
}
