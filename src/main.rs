use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use shellpipe::{ConfigLoader, ExecConfig, Node, ProcessHandle, StdinPolicy};

/// Run a program in the background and stream its output line by line.
#[derive(Parser, Debug)]
#[command(name = "shellpipe", version)]
struct Args {
    /// key=value engine configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Give the program /dev/null as stdin
    #[arg(long)]
    stdin_null: bool,

    /// Kill the program after this many milliseconds
    #[arg(long)]
    kill_after_ms: Option<u64>,

    program: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => match ConfigLoader::load_from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("shellpipe: {}", e);
                return ExitCode::from(2);
            }
        },
        None => ExecConfig::default(),
    };
    if args.stdin_null {
        config.stdin = StdinPolicy::Null;
    }

    let node = Node::leaf(&args.program, &args.args).in_background();
    let handle = ProcessHandle::with_config(node, config);
    if let Err(e) = handle.run() {
        eprintln!("shellpipe: {}", e);
        return ExitCode::from(2);
    }

    thread::scope(|scope| {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        if let Some(ms) = args.kill_after_ms {
            let handle = &handle;
            scope.spawn(move || {
                // Sender dropped means streaming ended before the deadline.
                if let Err(RecvTimeoutError::Timeout) =
                    done_rx.recv_timeout(Duration::from_millis(ms))
                {
                    if let Err(e) = handle.kill() {
                        eprintln!("shellpipe: {}", e);
                    }
                }
            });
        }

        let stdout = io::stdout();
        let mut out = stdout.lock();
        for (line, err) in handle.stream_lines() {
            if let Some(line) = line {
                let _ = write!(out, "out: {}", String::from_utf8_lossy(&line));
            }
            if let Some(line) = err {
                let _ = write!(out, "err: {}", String::from_utf8_lossy(&line));
            }
            let _ = out.flush();
        }
        drop(done_tx);
    });

    match handle.finish() {
        Ok(status) => {
            let code = status.and_then(|s| s.code());
            println!("exit: {}", code.map_or_else(|| "signal".to_string(), |c| c.to_string()));
            ExitCode::from(code.unwrap_or(1) as u8)
        }
        Err(e) => {
            eprintln!("shellpipe: {}", e);
            ExitCode::from(127)
        }
    }
}
