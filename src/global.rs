use std::sync::Arc;

use nix::unistd;
use tracing::debug;

use crate::config::Limits;
use crate::job::JobState;
use crate::launch::{self, LaunchError};
use crate::parser::{ParseError, Parser};
use crate::pipeline;
use crate::scanner::Scanner;
use crate::types::Directive;
use crate::vars::Vars;

/// Totals shown in the prompt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
	pub commands: usize,
	pub arguments: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
	Continue,
	/// Stop reading input and exit with this status. The store is already cleared.
	Exit(i32),
}

pub struct Shell {
	pub vars: Vars,
	pub jobs: Arc<JobState>,
	pub counters: Counters,
	pub limits: Limits,
}

impl Shell {
	pub fn new(limits: Limits) -> Shell {
		Shell {
			vars: Vars::new(limits.max_vars),
			jobs: Arc::new(JobState::new()),
			counters: Counters::default(),
			limits: limits,
		}
	}

	pub fn prompt(&self) -> nix::Result<String> {
		let cwd = unistd::getcwd()?;
		Ok(format!("#cmd:{}|#args:{} @{} ", self.counters.commands, self.counters.arguments, cwd.display()))
	}

	/// Runs every `;`-separated statement of `line` in order.
	pub fn run_line(&mut self, line: &str) -> Flow {
		let mut statements = Scanner::new(line);
		while let Some(statement) = statements.segment(b';') {
			if statement.trim().is_empty() {
				continue;
			}
			let flow = if statement.contains('|') {
				self.run_pipeline(statement)
			} else {
				self.run_single(statement)
			};
			if let Flow::Exit(_) = flow {
				self.vars.clear();
				return flow;
			}
		}
		Flow::Continue
	}

	fn run_single(&mut self, statement: &str) -> Flow {
		let directive = Parser::new(&mut self.vars, &self.jobs, self.limits).parse(statement);
		match directive {
			Directive::Runnable(command) => {
				let arguments = command.argv.len() + command.is_background as usize;
				let result = launch::launch(command, &self.vars, &self.jobs);
				self.finish_launch(1, arguments, result)
			},
			Directive::VariableAssignment => Flow::Continue,
			Directive::ExitRequested => Flow::Exit(0),
			Directive::ResumeBackgroundRequested => {
				match self.jobs.resume() {
					Ok(_) => self.count(1, 1),
					Err(e) => debug!("nothing resumed: {}", e),
				}
				Flow::Continue
			},
			Directive::ParseError(e) => {
				report(&e);
				Flow::Continue
			},
			Directive::AllocationFailure => out_of_memory(),
		}
	}

	/// Every stage is parsed before anything is forked, against a copy of the
	/// store so that a stage cannot change the shell's variables.
	fn run_pipeline(&mut self, statement: &str) -> Flow {
		let pipeline = pipeline::split_pipeline(statement);
		let mut scratch = self.vars.clone();
		let mut commands = Vec::with_capacity(pipeline.stages.len());
		for &stage in &pipeline.stages {
			let directive = Parser::new(&mut scratch, &self.jobs, self.limits).parse(stage);
			match directive {
				Directive::Runnable(command) => commands.push(command),
				Directive::ParseError(e) => {
					report(&e);
					return Flow::Continue;
				},
				Directive::AllocationFailure => return out_of_memory(),
				_ => {
					report(&ParseError::NotRunnable(stage.to_string()));
					return Flow::Continue;
				},
			}
		}
		if commands.is_empty() {
			return Flow::Continue;
		}
		let stages = commands.len();
		// a `&` counts as a word in whichever stage carried it
		let arguments = commands.iter().map(|c| c.argv.len() + c.is_background as usize).sum::<usize>();
		let result = launch::launch_pipeline(commands, pipeline.is_background, &scratch, &self.jobs);
		self.finish_launch(stages, arguments, result)
	}

	fn finish_launch(&mut self, commands: usize, arguments: usize, result: Result<(), LaunchError>) -> Flow {
		match result {
			Ok(()) => self.count(commands, arguments),
			Err(e) => {
				eprintln!("{}", e);
				if e.is_fatal() {
					return Flow::Exit(1);
				}
				if e.spawned() {
					self.count(commands, arguments);
				}
			},
		}
		Flow::Continue
	}

	fn count(&mut self, commands: usize, arguments: usize) {
		self.counters.commands += commands;
		self.counters.arguments += arguments;
	}
}

fn report(e: &ParseError) {
	if !e.is_silent() {
		eprintln!("{}", e);
	}
}

fn out_of_memory() -> Flow {
	eprintln!("malloc failed");
	Flow::Exit(1)
}
