use crate::scanner::Scanner;
use crate::types::Pipeline;

/// Splits a statement at every `|`, quoted or not.
///
/// Stages are trimmed of spaces and tabs and empty ones are dropped. A last
/// stage ending in `&` puts the whole pipeline in the background.
pub fn split_pipeline(command: &str) -> Pipeline<'_> {
	let mut scanner = Scanner::new(command);
	let mut stages = vec![];
	while let Some(field) = scanner.field(b'|') {
		let stage = field.trim_matches(|c: char| c == ' ' || c == '\t');
		if !stage.is_empty() {
			stages.push(stage);
		}
	}
	let is_background = stages.last().map_or(false, |s| s.ends_with('&'));
	Pipeline { stages: stages, is_background: is_background }
}
