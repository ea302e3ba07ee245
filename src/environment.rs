use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::process::Command;

/// Overrides layered on top of the caller's environment.
///
/// Spawned programs inherit everything the caller has; `set` and `unset`
/// only adjust individual variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    overrides: HashMap<OsString, Option<OsString>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<K: AsRef<OsStr>>(&self, key: K) -> Option<OsString> {
        match self.overrides.get(key.as_ref()) {
            Some(value) => value.clone(),
            None => std::env::var_os(key),
        }
    }

    pub fn set<K: Into<OsString>, V: Into<OsString>>(&mut self, key: K, value: V) {
        self.overrides.insert(key.into(), Some(value.into()));
    }

    pub fn unset<K: Into<OsString>>(&mut self, key: K) {
        self.overrides.insert(key.into(), None);
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    pub fn overrides(&self) -> Vec<(OsString, Option<OsString>)> {
        let mut all: Vec<_> = self
            .overrides
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort();
        all
    }

    pub fn apply(&self, command: &mut Command) {
        for (key, value) in &self.overrides {
            match value {
                Some(v) => command.env(key, v),
                None => command.env_remove(key),
            };
        }
    }
}
