//! Environment variable lookup

use std::{collections::HashMap, sync::Arc};

/// A source of environment variables
///
/// Credential resolution reads through this trait on every attempt, so a
/// changed variable takes effect without a restart.
pub trait Environment: Send + Sync {
    /// Returns the value of `key`, if set
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl Environment for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl<E: Environment + ?Sized> Environment for Arc<E> {
    fn var(&self, key: &str) -> Option<String> {
        (**self).var(key)
    }
}

/// Returns the trimmed value of `key` when it is set and not blank
pub(crate) fn non_empty(env: &dyn Environment, key: &str) -> Option<String> {
    env.var(key)
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
