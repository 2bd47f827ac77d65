mod config;
mod global;
mod job;
mod launch;
mod parser;
mod pipeline;
mod scanner;
mod types;
mod vars;

use std::io::{self, BufRead, IsTerminal, Write};
use std::process;

use anyhow::Context;
use argh::FromArgs;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use config::Limits;
use global::{Flow, Shell};

/// Minimal command shell with pipes, output redirection and variables.
#[derive(FromArgs)]
struct Args {
	/// do not print the prompt
	#[argh(switch, short = 'q')]
	quiet: bool,

	/// log filter such as `debug` or `msh::launch=trace`; RUST_LOG is read when absent
	#[argh(option)]
	log: Option<String>,
}

fn init_logging(filter: Option<&str>) {
	let filter = match filter {
		Some(f) => EnvFilter::new(f),
		None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
	};
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(io::stderr)
		.with_ansi(io::stderr().is_terminal())
		.init();
}

fn run(args: &Args) -> anyhow::Result<i32> {
	let limits = Limits::default();
	let mut shell = Shell::new(limits);
	job::install(shell.jobs.clone()).context("cannot install signal handlers")?;

	let mut stdout = io::stdout();
	let stdin = io::stdin();
	let mut stdin_locked = stdin.lock();
	let mut blank_lines = 0;
	loop {
		if !args.quiet {
			let prompt = shell.prompt().context("getcwd() error")?;
			let _ = stdout.write_all(prompt.as_bytes());
			let _ = stdout.flush();
		}
		let mut line: Vec<u8> = vec![];
		if stdin_locked.read_until(b'\n', &mut line).context("getline error")? == 0 {
			info!(vars = shell.vars.len(), "end of input");
			shell.vars.clear();
			return Ok(0);
		}
		if line.last() == Some(&b'\n') {
			line.pop();
		}
		if line.len() > limits.max_line {
			println!("input is too long");
			continue;
		}
		if line.is_empty() {
			blank_lines += 1;
			if blank_lines >= limits.blank_lines_to_exit {
				debug!("{} empty lines in a row", blank_lines);
				shell.vars.clear();
				return Ok(0);
			}
			continue;
		}
		blank_lines = 0;

		let reaped = job::reap_exited();
		if reaped > 0 {
			debug!(reaped, "collected finished children");
		}
		let line = match std::str::from_utf8(&line) {
			Ok(line) => line,
			Err(e) => {
				debug!(valid_up_to = e.valid_up_to(), "rejected line");
				eprintln!("input is not valid UTF-8");
				continue;
			},
		};
		if let Flow::Exit(code) = shell.run_line(line) {
			return Ok(code);
		}
	}
}

fn main() {
	let args: Args = argh::from_env();
	init_logging(args.log.as_deref());
	let code = match run(&args) {
		Ok(code) => code,
		Err(e) => {
			eprintln!("msh: {:#}", e);
			1
		},
	};
	process::exit(code);
}
