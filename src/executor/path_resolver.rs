use std::env;
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::ast::Node;
use crate::error::ExecError;

pub struct PathResolver;

impl PathResolver {
    pub fn resolve(&self, command: &str) -> Option<PathBuf> {
        if command.contains('/') {
            let path = Path::new(command);
            if path.is_file() {
                return Some(path.to_path_buf());
            } else {
                return None;
            }
        }

        let paths = env::var_os("PATH")?;
        env::split_paths(&paths)
            .map(|dir| dir.join(command))
            .find(|full_path| is_executable(full_path))
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// A resolved program, ready to be turned into leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    path: PathBuf,
}

impl Program {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn call<I, A>(&self, args: I) -> Node
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Node::leaf(self.path.clone(), args)
    }
}

pub fn resolve(name: &str) -> Result<Program, ExecError> {
    PathResolver
        .resolve(name)
        .map(|path| Program { path })
        .ok_or_else(|| ExecError::CommandNotFound(name.to_string()))
}
