mod capture;
mod engine;
mod handle;
mod path_resolver;

pub use capture::{Channel, StreamLine};
pub use engine::ProcessRecord;
pub use handle::{HandleState, ProcessHandle, StreamLines};
pub use path_resolver::{PathResolver, Program, resolve};
