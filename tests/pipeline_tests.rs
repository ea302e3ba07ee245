//! End-to-end tests spawning real programs.
//!
//! Only tools present on any POSIX box are used: sh, echo, grep, sort, tr,
//! cat, head, yes, sleep, true, false.

use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use shellpipe::{
    ConfigLoader, ExecConfig, ExecError, HandleState, Node, ProcessHandle, StdinPolicy, pipe, seq,
};

fn sh(script: &str) -> Node {
    Node::leaf("sh", ["-c", script])
}

fn quiet_config() -> ExecConfig {
    let mut config = ExecConfig::default();
    config.stdin = StdinPolicy::Null;
    config
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn literal_piped_into_grep() {
    let node = pipe("SHELL is\nso\nCOOL!", Node::leaf("grep", ["SHELL"]));
    let handle = node.start().unwrap();
    assert_eq!(handle.stdout().unwrap(), b"SHELL is\n".to_vec());
    assert_eq!(handle.exit_code(), Some(0));
}

#[test]
fn async_sleep_reports_running_until_joined() {
    let handle = Node::leaf("sleep", ["1"]).in_background().start().unwrap();
    assert!(handle.running(), "async handle should be running right after run()");
    assert_eq!(handle.stdout().unwrap(), Vec::<u8>::new());
    assert!(!handle.running());
    assert_eq!(handle.state(), HandleState::Finished);
    assert_eq!(handle.exit_code(), Some(0));
}

#[test]
fn kill_long_running_async_sleep() {
    let started = Instant::now();
    let handle = Node::leaf("sleep", ["100"]).in_background().start().unwrap();
    thread::sleep(Duration::from_millis(20));
    handle.kill().unwrap();
    assert_eq!(handle.state(), HandleState::Killed);

    let out = handle.stdout().unwrap();
    assert!(out.is_empty());
    assert!(started.elapsed() < Duration::from_secs(10), "stdout access hung after kill");
    assert_eq!(handle.state(), HandleState::Killed);
    // Killed by signal, so there is no exit code.
    assert_eq!(handle.exit_code(), None);
    assert!(handle.exit_status().is_some());
}

#[test]
fn kill_racing_the_first_spawn_still_applies() {
    for _ in 0..5 {
        let handle = Node::leaf("sleep", ["100"]).in_background().start().unwrap();
        handle.kill().unwrap();
        let started = Instant::now();
        handle.finish().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

#[test]
fn sequence_ignores_left_exit_code() {
    let handle = seq(Node::command("false"), Node::leaf("echo", ["ok"]))
        .start()
        .unwrap();
    assert_eq!(handle.stdout().unwrap(), b"ok\n".to_vec());
    assert_eq!(handle.exit_code(), Some(0));
    let records = handle.processes();
    assert_eq!(records[0].status.and_then(|s| s.code()), Some(1));
}

#[test]
fn reused_leaf_spawns_independent_processes() {
    let producer = sh("echo $$");
    let first = producer.clone().pipe(Node::command("cat"));
    let second = producer.pipe(Node::leaf("tr", ["0-9", "a-j"]));

    let a = first.start().unwrap();
    let b = second.start().unwrap();
    let a_out = a.stdout().unwrap();
    let b_out = b.stdout().unwrap();

    assert_ne!(a.pid(), b.pid());
    assert_ne!(a.pids(), b.pids());
    assert_eq!(a.pids().len(), 2);
    assert_eq!(b.pids().len(), 2);
    assert_eq!(String::from_utf8(a_out).unwrap().trim(), a.pid().unwrap().to_string());
    assert!(b_out.iter().all(|c| !c.is_ascii_digit()));
}

// ============================================================================
// Composition properties
// ============================================================================

#[test]
fn pipe_matches_manual_feeding() {
    let producer = ("printf", ["b\\na\\nc\\nb\\n"]);
    let consumer = ("sort", ["-u"]);

    let left = Command::new(producer.0).args(producer.1).output().unwrap();
    let mut right = Command::new(consumer.0)
        .args(consumer.1)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    right.stdin.take().unwrap().write_all(&left.stdout).unwrap();
    let expected = right.wait_with_output().unwrap().stdout;

    let node = Node::leaf(producer.0, producer.1).pipe(Node::leaf(consumer.0, consumer.1));
    let handle = node.start().unwrap();
    assert_eq!(handle.stdout().unwrap(), expected);
    assert_eq!(expected, b"a\nb\nc\n".to_vec());
}

#[test]
fn sequence_spawns_right_after_left_exit() {
    let node = sh("sleep 0.2; echo first").seq(sh("echo second"));
    let handle = node.start().unwrap();
    assert_eq!(handle.stdout().unwrap(), b"first\nsecond\n".to_vec());

    let records = handle.processes();
    assert_eq!(records.len(), 2);
    assert!(records[0].stage < records[1].stage);
    assert!(records.iter().all(|r| r.status.is_some()));
}

#[test]
fn errpipe_feeds_stderr_only() {
    let node = sh("echo to-out; echo to-err >&2").errpipe(Node::leaf("tr", ["a-z", "A-Z"]));
    let handle = node.start().unwrap();
    let out = String::from_utf8(handle.stdout().unwrap()).unwrap();
    let mut lines: Vec<&str> = out.lines().collect();
    lines.sort();
    assert_eq!(lines, vec!["TO-ERR", "to-out"]);
    assert!(handle.stderr().unwrap().is_empty());
}

#[test]
fn pipe_all_feeds_both_streams() {
    let node = sh("echo a; echo b >&2").pipe_all(Node::command("sort"));
    let handle = node.start().unwrap();
    assert_eq!(handle.stdout().unwrap(), b"a\nb\n".to_vec());
}

#[test]
fn stderr_is_captured_separately() {
    let handle = sh("echo out; echo err >&2; exit 4").start().unwrap();
    assert_eq!(handle.stdout().unwrap(), b"out\n".to_vec());
    assert_eq!(handle.stderr().unwrap(), b"err\n".to_vec());
    let all = handle.all().unwrap();
    assert_eq!(all.len(), 8);
    assert_eq!(handle.exit_code(), Some(4));
}

#[test]
fn background_left_of_sequence_finishes_first() {
    let node = sh("sleep 0.3; echo left").in_background().seq(Node::leaf("echo", ["right"]));
    let handle = node.start().unwrap();
    assert_eq!(handle.stdout().unwrap(), b"left\nright\n".to_vec());

    let records = handle.processes();
    assert!(records[0].status.is_some());
    assert!(records[0].stage < records[1].stage);
}

#[test]
fn sequence_feeding_a_pipe_larger_than_its_buffer() {
    let node = Node::leaf("head", ["-c", "200000", "/dev/zero"])
        .seq(Node::command("true"))
        .pipe(Node::leaf("wc", ["-c"]))
        .in_background();
    let handle = node.start().unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || !handle.running()),
        "sequence on the left of a pipe stalled"
    );
    let out = String::from_utf8(handle.stdout().unwrap()).unwrap();
    assert_eq!(out.trim(), "200000");
    assert_eq!(handle.pids().len(), 3);
}

#[test]
fn sequence_on_both_sides_of_a_pipe() {
    let node = seq(sh("echo b"), sh("echo a"))
        .pipe(seq(Node::command("sort"), Node::leaf("echo", ["end"])));
    let handle = node.start().unwrap();
    assert_eq!(handle.stdout().unwrap(), b"a\nb\nend\n".to_vec());
}

// ============================================================================
// Streaming
// ============================================================================

#[test]
fn stream_line_visible_while_running() {
    let handle = sh("echo early; exec sleep 5").in_background().start().unwrap();
    let mut seen = None;
    let found = wait_until(Duration::from_secs(5), || {
        if let (Some(line), _) = handle.next_stream_line() {
            seen = Some(line);
        }
        seen.is_some()
    });
    assert!(found, "line never arrived");
    assert_eq!(seen, Some(b"early\n".to_vec()));
    assert!(handle.running());
    assert!(!handle.stream_empty());
    handle.kill().unwrap();
    handle.finish().unwrap();
}

#[test]
fn stream_lines_preserve_order() {
    let handle = sh("for i in 1 2 3 4 5; do echo $i; echo e$i >&2; done")
        .in_background()
        .start()
        .unwrap();
    let mut out = Vec::new();
    let mut err = Vec::new();
    while handle.running() || !handle.stream_empty() {
        let (o, e) = handle.next_stream_line();
        out.extend(o);
        err.extend(e);
    }
    assert_eq!(out, vec![b"1\n".to_vec(), b"2\n".to_vec(), b"3\n".to_vec(), b"4\n".to_vec(), b"5\n".to_vec()]);
    assert_eq!(err.len(), 5);
    assert_eq!(err[0], b"e1\n".to_vec());
    assert!(handle.stream_empty());
}

#[test]
fn stream_lines_iterator_ends() {
    let handle = sh("printf 'a\\nb\\nno-newline'").in_background().start().unwrap();
    let out: Vec<u8> = handle
        .stream_lines()
        .filter_map(|(o, _)| o)
        .flatten()
        .collect();
    assert_eq!(out, b"a\nb\nno-newline".to_vec());
    assert!(handle.stream_empty());
}

// ============================================================================
// Errors and lifecycle
// ============================================================================

#[test]
fn missing_program_in_pipeline_keeps_sibling_output() {
    let node = sh("echo partial; echo more >&2")
        .errpipe(Node::command("definitely_not_a_real_command_12345"));
    let handle = node.start().unwrap();
    let err = handle.stdout().unwrap_err();
    match &err {
        ExecError::Spawn { command, .. } => {
            assert_eq!(command, "definitely_not_a_real_command_12345")
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(handle.peek_stdout(), b"partial\n".to_vec());
}

#[test]
fn consumer_exiting_early_is_a_notice() {
    let node = Node::command("yes").pipe(Node::leaf("head", ["-n", "1"]));
    let handle = node.start().unwrap();
    assert_eq!(handle.stdout().unwrap(), b"y\n".to_vec());
    assert!(handle.notices().iter().any(|n| matches!(n, ExecError::BrokenPipe(_))));
}

#[test]
fn literal_larger_than_consumer_reads() {
    let payload = vec![b'x'; 1 << 20];
    let node = pipe(payload, Node::leaf("head", ["-c", "3"]));
    let handle = node.start().unwrap();
    assert_eq!(handle.stdout().unwrap(), b"xxx".to_vec());
    assert!(handle.notices().iter().any(|n| matches!(n, ExecError::BrokenPipe(_))));
}

#[test]
fn literal_on_right_is_invalid() {
    let node = Node::leaf("echo", ["hi"]).pipe("not a program");
    let handle = node.start().unwrap();
    assert!(matches!(handle.finish(), Err(ExecError::InvalidNode(_))));
}

#[test]
fn run_is_one_shot() {
    let handle = ProcessHandle::new(Node::leaf("sleep", ["0.1"]).in_background());
    handle.run().unwrap();
    assert_eq!(handle.run(), Err(ExecError::AlreadyStarted));
    handle.finish().unwrap();
    assert_eq!(handle.pids().len(), 1);
}

#[test]
fn kill_does_not_cancel_queued_sequence_side() {
    let node = Node::leaf("sleep", ["100"])
        .seq(Node::leaf("echo", ["after"]))
        .in_background();
    let handle = node.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || handle.pid().is_some()));
    handle.kill().unwrap();
    assert_eq!(handle.stdout().unwrap(), b"after\n".to_vec());
    assert_eq!(handle.state(), HandleState::Killed);
    assert_eq!(handle.pids().len(), 2);
}

#[test]
fn kill_reaches_grandchildren() {
    let started = Instant::now();
    let handle = sh("sleep 4; echo late").in_background().start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || handle.pid().is_some()));
    thread::sleep(Duration::from_millis(50));
    handle.kill().unwrap();
    assert_eq!(handle.stdout().unwrap(), Vec::<u8>::new());
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "stdout waited for the shell's child after kill"
    );
}

#[test]
fn kill_during_right_stage_of_background_sequence() {
    let started = Instant::now();
    let node = seq(sh("echo one"), sh("sleep 100; echo two")).in_background();
    let handle = node.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || handle.pids().len() == 2));
    handle.kill().unwrap();

    assert_eq!(handle.stdout().unwrap(), b"one\n".to_vec());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(handle.state(), HandleState::Killed);
    let records = handle.processes();
    assert_eq!(records[0].status.and_then(|s| s.code()), Some(0));
    assert_eq!(records[1].stage, 1);
    assert_eq!(records[1].status.and_then(|s| s.code()), None);
}

#[test]
fn finish_from_another_thread() {
    let handle = sh("sleep 0.2; echo done").in_background().start().unwrap();
    thread::scope(|scope| {
        let waiter = scope.spawn(|| handle.finish());
        assert_eq!(handle.stdout().unwrap(), b"done\n".to_vec());
        let status = waiter.join().unwrap().unwrap();
        assert_eq!(status.and_then(|s| s.code()), Some(0));
    });
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn environment_overrides_reach_children() {
    let config = ConfigLoader::load_from_str("env.SHELLPIPE_GREETING=hi\nstdin=null\n").unwrap();
    let handle = ProcessHandle::with_config(sh("echo $SHELLPIPE_GREETING"), config);
    handle.run().unwrap();
    assert_eq!(handle.stdout().unwrap(), b"hi\n".to_vec());
}

#[test]
fn null_stdin_gives_immediate_eof() {
    let handle = ProcessHandle::with_config(Node::command("cat"), quiet_config());
    handle.run().unwrap();
    assert_eq!(handle.stdout().unwrap(), Vec::<u8>::new());
}

#[test]
fn configured_kill_signal_is_used() {
    use std::os::unix::process::ExitStatusExt;

    let config = ConfigLoader::load_from_str("kill_signal=TERM").unwrap();
    let handle = ProcessHandle::with_config(Node::leaf("sleep", ["100"]).in_background(), config);
    handle.run().unwrap();
    assert!(wait_until(Duration::from_secs(5), || handle.pid().is_some()));
    handle.kill().unwrap();
    let status = handle.finish().unwrap().unwrap();
    assert_eq!(status.signal(), Some(15));
}
