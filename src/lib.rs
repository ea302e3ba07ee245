pub mod ast;
pub mod config;
pub mod environment;
pub mod error;
pub mod executor;

pub use ast::{Node, background, errpipe, pipe, pipe_all, seq};
pub use config::{ConfigLoader, ExecConfig, StdinPolicy};
pub use environment::Environment;
pub use error::{ConfigError, ExecError};
pub use executor::{HandleState, ProcessHandle, ProcessRecord, Program, StreamLine, resolve};
