use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::environment::Environment;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinPolicy {
    Inherit,
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecConfig {
    /// Sent by `kill()`; a single forceful signal by default.
    pub kill_signal: Signal,
    pub read_chunk_size: usize,
    /// Stdin for leaves that are not fed by a pipe.
    pub stdin: StdinPolicy,
    /// Sleep between empty polls in `stream_lines()`.
    pub poll_interval: Duration,
    pub environment: Environment,
}

impl Default for ExecConfig {
    fn default() -> Self {
        ConfigLoader::default_config()
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn default_config() -> ExecConfig {
        ExecConfig {
            kill_signal: Signal::SIGKILL,
            read_chunk_size: 8 * 1024,
            stdin: StdinPolicy::Inherit,
            poll_interval: Duration::from_millis(5),
            environment: Environment::new(),
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<ExecConfig, ConfigError> {
        let src = std::fs::read_to_string(path)?;
        Self::load_from_str(&src)
    }

    pub fn load_from_str(src: &str) -> Result<ExecConfig, ConfigError> {
        let mut config = ConfigLoader::default_config();

        for (lineno, line) in src.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parse_err = |message: String| ConfigError::Parse {
                line: lineno + 1,
                message,
            };
            let Some((key, value)) = line.split_once('=') else {
                return Err(parse_err(format!("No '=' found: {}", line)));
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "kill_signal" => {
                    config.kill_signal = parse_signal(value)
                        .ok_or_else(|| parse_err(format!("Unknown signal: {}", value)))?;
                }
                "read_chunk_size" => match value.parse::<usize>() {
                    Ok(n) if n > 0 => config.read_chunk_size = n,
                    _ => return Err(parse_err(format!("Invalid chunk size: {}", value))),
                },
                "stdin" => {
                    config.stdin = match value {
                        "inherit" => StdinPolicy::Inherit,
                        "null" => StdinPolicy::Null,
                        _ => return Err(parse_err(format!("Invalid stdin policy: {}", value))),
                    };
                }
                "poll_interval_ms" => match value.parse::<u64>() {
                    Ok(ms) => config.poll_interval = Duration::from_millis(ms),
                    Err(_) => return Err(parse_err(format!("Invalid interval: {}", value))),
                },
                k if k.starts_with("env.") => {
                    config.environment.set(k.trim_start_matches("env."), value);
                }
                k if k.starts_with("unset.") => {
                    config.environment.unset(k.trim_start_matches("unset."));
                }
                _ => return Err(parse_err(format!("Unknown key: {}", key))),
            }
        }

        Ok(config)
    }
}

/// Accepts `SIGTERM`, `TERM` or a signal number.
fn parse_signal(value: &str) -> Option<Signal> {
    if let Ok(n) = value.parse::<i32>() {
        return Signal::try_from(n).ok();
    }
    let upper = value.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&name).ok()
}
