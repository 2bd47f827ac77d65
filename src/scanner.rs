//! Cursor over one line of input.
//!
//! Every scanner carries its own position, so a pipeline stage can be
//! tokenized while the statement containing it is still being split.

pub struct Scanner<'a> {
	line: &'a str,
	i: usize,
}

impl<'a> Scanner<'a> {
	pub fn new(line: &'a str) -> Scanner<'a> {
		Scanner { line: line, i: 0 }
	}

	fn peek(&self) -> Option<u8> {
		self.line.as_bytes().get(self.i).cloned()
	}

	fn proceed_while<F>(&mut self, f: F) where F: Fn(u8) -> bool {
		while let Some(c) = self.peek() {
			if !f(c) { break; }
			self.i += 1;
		}
	}

	/// Next non-empty run of bytes other than `delim`. Runs of `delim` are
	/// skipped, so consecutive separators never produce empty fields.
	pub fn field(&mut self, delim: u8) -> Option<&'a str> {
		self.proceed_while(|c| c == delim);
		if self.peek().is_none() {
			return None;
		}
		let orig = self.i;
		self.proceed_while(|c| c != delim);
		Some(&self.line[orig .. self.i])
	}

	/// Next segment ending at a `delim` that is not inside double quotes.
	/// Segments may be empty. Returns `None` once the line is used up.
	pub fn segment(&mut self, delim: u8) -> Option<&'a str> {
		if self.i > self.line.len() {
			return None;
		}
		let orig = self.i;
		let mut quoted = false;
		while let Some(c) = self.peek() {
			if c == b'"' {
				quoted = !quoted;
			} else if c == delim && !quoted {
				break;
			}
			self.i += 1;
		}
		let segment = &self.line[orig .. self.i];
		self.i += 1;
		Some(segment)
	}

	/// Next word for `echo`.
	///
	/// A word opening with `"` starts a quoted span; inside a span spaces do not
	/// end the word. The opening quote is consumed, any later quote is kept in
	/// the word and toggles `in_quotes`, which is left set when the line ends
	/// inside a span.
	pub fn echo_word(&mut self, in_quotes: &mut bool) -> Option<&'a str> {
		self.proceed_while(|c| c == b' ');
		if self.peek().is_none() {
			return None;
		}
		if self.peek() == Some(b'"') {
			*in_quotes = true;
			self.i += 1;
		}
		let orig = self.i;
		while let Some(c) = self.peek() {
			if c == b' ' && !*in_quotes {
				break;
			}
			if c == b'"' {
				*in_quotes = !*in_quotes;
			}
			self.i += 1;
		}
		Some(&self.line[orig .. self.i])
	}
}
