// End-to-end tests: the `msh` binary is driven through stdin and judged by
// its stdout, stderr, exit status and the files its commands write.

use std::fs;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStdin, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use predicates::prelude::*;
use tempfile::TempDir;

fn msh() -> Command {
	let mut cmd = cargo_bin_cmd!("msh");
	cmd.arg("--quiet");
	cmd
}

fn in_dir(dir: &TempDir, name: &str) -> String {
	dir.path().join(name).to_str().unwrap().to_string()
}

/// Starts the shell as the leader of a process group of its own, the way a
/// job-control shell starts commands, so that terminal stop signals reach it.
fn spawn_msh(dir: &TempDir, stdout: Stdio) -> (Child, ChildStdin) {
	let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_msh"))
		.current_dir(dir.path())
		.process_group(0)
		.stdin(Stdio::piped())
		.stdout(stdout)
		.stderr(Stdio::null())
		.spawn()
		.unwrap();
	let stdin = child.stdin.take().unwrap();
	(child, stdin)
}

/// The state letter of `/proc/<pid>/stat`, `None` once the process is gone.
fn process_state(pid: Pid) -> Option<char> {
	let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
	let after_name = stat.rfind(')')?;
	stat[after_name + 1 ..].trim_start().chars().next()
}

fn wait_for_state<F>(pid: Pid, timeout: Duration, wanted: F) -> bool
where
	F: Fn(Option<char>) -> bool,
{
	let deadline = Instant::now() + timeout;
	while Instant::now() < deadline {
		if wanted(process_state(pid)) {
			return true;
		}
		thread::sleep(Duration::from_millis(20));
	}
	false
}

fn read_pid(path: &Path) -> Pid {
	let pid = wait_for_file(path, Duration::from_secs(5)).expect("process started");
	Pid::from_raw(pid.trim().parse().unwrap())
}

fn wait_for_file(path: &Path, timeout: Duration) -> Option<String> {
	let deadline = Instant::now() + timeout;
	while Instant::now() < deadline {
		if let Ok(contents) = fs::read_to_string(path) {
			if contents.ends_with('\n') {
				return Some(contents);
			}
		}
		thread::sleep(Duration::from_millis(20));
	}
	None
}

#[test]
fn three_empty_lines_exit() {
	msh()
		.write_stdin("echo a\n\n\n\necho never\n")
		.assert()
		.success()
		.stdout("a\n");
}

#[test]
fn command_between_empty_lines_resets_the_count() {
	msh()
		.write_stdin("\n\necho a\n\n\necho b\n\n\n\necho never\n")
		.assert()
		.success()
		.stdout("a\nb\n");
}

#[test]
fn exit_skips_the_rest() {
	msh()
		.write_stdin("echo before; exit; echo after\necho later\n")
		.assert()
		.success()
		.stdout("before\n");
}

#[test]
fn end_of_input_exits_cleanly() {
	msh().write_stdin("echo last").assert().success().stdout("last\n");
}

#[test]
fn variables_are_substituted() {
	msh()
		.write_stdin("greeting=hello\necho $greeting world\n")
		.assert()
		.success()
		.stdout("hello world\n");
}

#[test]
fn quoted_value_keeps_single_spaces() {
	msh()
		.write_stdin("msg=\"one    two\"\nprintf %s\\n $msg\n")
		.assert()
		.stdout("one two\n");
}

#[test]
fn echo_keeps_quoted_spacing() {
	msh().write_stdin("echo \"a   b\" c\n").assert().stdout("a   b c\n");
}

#[test]
fn echo_of_unset_variable_prints_a_space() {
	msh().write_stdin("echo $UNSET\n").assert().stdout(" \n");
}

#[test]
fn quoted_semicolon_does_not_split() {
	msh().write_stdin("echo \"a;b\"; echo c\n").assert().stdout("a;b\nc\n");
}

#[test]
fn ambiguous_assignment_is_rejected() {
	msh()
		.write_stdin("a=b=c\necho $a\n")
		.assert()
		.success()
		.stderr(predicate::str::contains("ambiguous use of '=' in assignment to a"))
		.stdout(" \n");
}

#[test]
fn unassigned_variable_outside_echo() {
	msh()
		.write_stdin("ls $missing\n")
		.assert()
		.stderr(predicate::str::contains("missing isn't assigned"));
}

#[test]
fn too_many_arguments() {
	msh()
		.write_stdin("true 1 2 3 4 5 6 7 8 9 10\necho 1 2 3 4 5 6 7 8 9 10\n")
		.assert()
		.success()
		.stdout("")
		.stderr(predicate::str::contains("too many arguments"))
		.stderr(predicate::str::contains("Error: Too many words in input string"));
}

#[test]
fn cd_is_not_supported() {
	msh().write_stdin("cd /tmp\n").assert().stderr(predicate::str::contains("cd not supported"));
}

#[test]
fn unknown_command() {
	msh()
		.write_stdin("msh-no-such-program -x\n")
		.assert()
		.success()
		.stderr(predicate::str::contains("msh-no-such-program: command not found"));
}

#[test]
fn overlong_line_is_discarded() {
	let long = "x".repeat(511);
	msh()
		.write_stdin(format!("{}\necho ok\n", long))
		.assert()
		.stdout("input is too long\nok\n")
		.stderr(predicate::str::contains("command not found").not());
}

#[test]
fn line_with_invalid_utf8_is_not_run() {
	let dir = tempfile::tempdir().unwrap();
	let out = in_dir(&dir, "out");
	let mut input = b"printf %s \xff > ".to_vec();
	input.extend_from_slice(out.as_bytes());
	input.push(b'\n');
	input.extend_from_slice(b"echo ok\n");
	msh()
		.write_stdin(input)
		.assert()
		.success()
		.stdout("ok\n")
		.stderr(predicate::str::contains("input is not valid UTF-8"));
	assert!(!Path::new(&out).exists());
}

#[test]
fn redirect_truncates_file() {
	let dir = tempfile::tempdir().unwrap();
	let out = in_dir(&dir, "out.txt");
	fs::write(&out, "a much longer previous content\n").unwrap();
	msh()
		.write_stdin(format!("echo hi > {}\n", out))
		.assert()
		.success()
		.stdout("");
	assert_eq!(fs::read_to_string(&out).unwrap(), "hi\n");
}

#[test]
fn redirect_to_variable_destination() {
	let dir = tempfile::tempdir().unwrap();
	let out = in_dir(&dir, "dest");
	msh().write_stdin(format!("dest={}\necho via var>$dest\n", out)).assert().success();
	assert_eq!(fs::read_to_string(&out).unwrap(), "via var\n");
}

#[test]
fn pipeline_connects_stages() {
	msh().write_stdin("echo hello | tr a-z A-Z | tr L l\n").assert().success().stdout("HEllO\n");
}

#[test]
fn pipeline_last_stage_redirects() {
	let dir = tempfile::tempdir().unwrap();
	let out = in_dir(&dir, "count");
	msh().write_stdin(format!("echo a b c | wc -w > {}\n", out)).assert().stdout("");
	assert_eq!(fs::read_to_string(&out).unwrap().trim(), "3");
}

#[test]
fn prompt_tracks_commands_and_arguments() {
	let dir = tempfile::tempdir().unwrap();
	let mut cmd = cargo_bin_cmd!("msh");
	cmd.current_dir(dir.path())
		.write_stdin("true a b\ntrue | true x\ncd /\n")
		.assert()
		.success()
		.stdout(predicate::str::contains("#cmd:0|#args:0 @"))
		.stdout(predicate::str::contains("#cmd:1|#args:3 @"))
		.stdout(predicate::str::contains("#cmd:3|#args:6 @"))
		.stdout(predicate::str::contains("#cmd:4").not());
}

#[test]
fn background_command_does_not_block() {
	let started = Instant::now();
	let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_msh"))
		.arg("--quiet")
		.stdin(Stdio::piped())
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.spawn()
		.unwrap();
	child.stdin.take().unwrap().write_all(b"sleep 3 &\nexit\n").unwrap();
	assert!(child.wait().unwrap().success());
	assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn pipeline_waits_only_for_the_last_stage() {
	let dir = tempfile::tempdir().unwrap();
	let out = in_dir(&dir, "out");
	let (mut shell, mut stdin) = spawn_msh(&dir, Stdio::null());
	let started = Instant::now();
	stdin.write_all(format!("sleep 3 | echo x > {}\nexit\n", out).as_bytes()).unwrap();
	drop(stdin);
	assert!(shell.wait().unwrap().success());
	assert!(started.elapsed() < Duration::from_secs(2));
	assert_eq!(fs::read_to_string(&out).unwrap(), "x\n");
}

#[test]
fn finished_background_job_is_reaped() {
	let dir = tempfile::tempdir().unwrap();
	let pid_file = dir.path().join("pid");
	let script = in_dir(&dir, "job.sh");
	fs::write(&script, format!("echo $$ > {}\n", pid_file.display())).unwrap();

	let (mut shell, mut stdin) = spawn_msh(&dir, Stdio::null());
	stdin.write_all(format!("sh {} &\n", script).as_bytes()).unwrap();
	stdin.flush().unwrap();
	let pid = read_pid(&pid_file);
	// no zombie is left behind while the shell sits at its prompt
	let gone = wait_for_state(pid, Duration::from_secs(5), |state| state.is_none());

	stdin.write_all(b"exit\n").unwrap();
	drop(stdin);
	assert!(shell.wait().unwrap().success());
	assert!(gone, "state of {} is {:?}", pid, process_state(pid));
}

#[test]
fn stop_request_pauses_foreground_and_bg_resumes_it() {
	let dir = tempfile::tempdir().unwrap();
	let pid_file = dir.path().join("pid");
	let done_file = dir.path().join("done");
	let script = in_dir(&dir, "job.sh");
	fs::write(
		&script,
		format!("echo $$ > {}\nsleep 2\necho resumed $$ > {}\n", pid_file.display(), done_file.display()),
	)
	.unwrap();

	let (shell, mut stdin) = spawn_msh(&dir, Stdio::piped());
	stdin.write_all(format!("sh {}\n", script).as_bytes()).unwrap();
	stdin.flush().unwrap();
	let pid = read_pid(&pid_file);

	signal::kill(Pid::from_raw(shell.id() as i32), Signal::SIGTSTP).unwrap();
	assert!(wait_for_state(pid, Duration::from_secs(5), |state| state == Some('T')));

	stdin.write_all(b"bg\nexit\n").unwrap();
	drop(stdin);
	let output = shell.wait_with_output().unwrap();
	assert!(output.status.success());
	assert!(String::from_utf8_lossy(&output.stdout).contains("#cmd:2|#args:3 @"));
	assert_eq!(
		wait_for_file(&done_file, Duration::from_secs(5)),
		Some(format!("resumed {}\n", pid))
	);
}

#[test]
fn stop_request_leaves_background_job_running() {
	let dir = tempfile::tempdir().unwrap();
	let bg_pid_file = dir.path().join("bg");
	let fg_pid_file = dir.path().join("fg");
	let bg_script = in_dir(&dir, "bg.sh");
	let fg_script = in_dir(&dir, "fg.sh");
	fs::write(&bg_script, format!("echo $$ > {}\nsleep 5\n", bg_pid_file.display())).unwrap();
	fs::write(&fg_script, format!("echo $$ > {}\nsleep 5\n", fg_pid_file.display())).unwrap();

	let (mut shell, mut stdin) = spawn_msh(&dir, Stdio::null());
	stdin.write_all(format!("sh {} &\nsh {}\n", bg_script, fg_script).as_bytes()).unwrap();
	stdin.flush().unwrap();
	let bg = read_pid(&bg_pid_file);
	let fg = read_pid(&fg_pid_file);

	// what a terminal does on ^Z: the whole foreground group gets the signal
	let group = Pid::from_raw(shell.id() as i32);
	signal::killpg(group, Signal::SIGTSTP).unwrap();
	let fg_stopped = wait_for_state(fg, Duration::from_secs(5), |state| state == Some('T'));
	thread::sleep(Duration::from_millis(200));
	let bg_state = process_state(bg);

	let _ = signal::kill(fg, Signal::SIGKILL);
	let _ = signal::kill(bg, Signal::SIGKILL);
	let _ = signal::killpg(group, Signal::SIGCONT);
	stdin.write_all(b"exit\n").unwrap();
	drop(stdin);
	assert!(shell.wait().unwrap().success());

	assert!(fg_stopped);
	assert!(bg_state.is_some());
	assert_ne!(bg_state, Some('T'));
}
