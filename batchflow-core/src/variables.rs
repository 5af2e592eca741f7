//! Named values shared by a pipeline lineage

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::error::{Error, Result};

/// Shared table of pipeline variables.
///
/// Clones share the same table; [`Variables::fork`] makes an independent copy.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    cells: Arc<RwLock<HashMap<String, Value>>>,
}

impl Variables {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value` unless it is already defined
    pub fn init(&self, name: &str, value: Value) {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        cells.entry(name.to_string()).or_insert(value);
    }

    /// Current value of `name`
    pub fn get(&self, name: &str) -> Result<Value> {
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        cells.get(name).cloned().ok_or_else(|| Error::Variable(name.to_string()))
    }

    /// Overwrite `name`, which must have been initialized
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        match cells.get_mut(name) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(Error::Variable(name.to_string())),
        }
    }

    /// Replace `name` with `f(current)` under one lock
    pub fn update<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&Value) -> Value,
    {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        match cells.get_mut(name) {
            Some(cell) => {
                *cell = f(cell);
                Ok(())
            }
            None => Err(Error::Variable(name.to_string())),
        }
    }

    /// Whether `name` is defined
    pub fn contains(&self, name: &str) -> bool {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// An independent copy of the current values
    #[must_use]
    pub fn fork(&self) -> Self {
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner).clone();
        Self {
            cells: Arc::new(RwLock::new(cells)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_keeps_the_first_value() {
        let vars = Variables::new();
        vars.init("seen", json!(0));
        vars.init("seen", json!(10));
        assert_eq!(vars.get("seen").unwrap(), json!(0));
    }

    #[test]
    fn unknown_names_are_reported() {
        let vars = Variables::new();
        assert_eq!(vars.get("nope"), Err(Error::Variable("nope".into())));
        assert!(vars.set("nope", json!(1)).is_err());
        assert!(vars.update("nope", |v| v.clone()).is_err());
    }

    #[test]
    fn clones_share_and_forks_do_not() {
        let vars = Variables::new();
        vars.init("count", json!(1));
        let shared = vars.clone();
        let forked = vars.fork();
        shared.update("count", |v| json!(v.as_i64().unwrap_or(0) + 1)).unwrap();
        assert_eq!(vars.get("count").unwrap(), json!(2));
        assert_eq!(forked.get("count").unwrap(), json!(1));
    }
}
