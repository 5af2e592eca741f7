//! Recorded pipeline actions
//!
//! An [`Action`] is one operation appended to a pipeline but not yet run. It
//! is a tagged variant (whole-batch transform, item map, branch, variable
//! update, join) with an explicit execution mode and error policy. Actions
//! are immutable once built; an [`ActionQueue`] only ever grows by producing
//! a new queue.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::batch::{Batch, Item};
use crate::error::{Error, Result};
use crate::index::Key;
use crate::pipeline::Pipeline;

/// Whole-batch transformation
pub type BatchFn<K, T> = Arc<dyn Fn(Batch<K, T>) -> anyhow::Result<Batch<K, T>> + Send + Sync>;

/// Per-item transformation
pub type ItemFn<K, T> = Arc<dyn Fn(&K, T) -> anyhow::Result<T> + Send + Sync>;

/// Combines the outputs of branch arms for one identifier, in arm order
pub type MergeFn<K, T> = Arc<dyn Fn(&K, Vec<T>) -> anyhow::Result<T> + Send + Sync>;

/// Combines an item with the item of a joined pipeline for the same identifier
pub type JoinFn<K, T> = Arc<dyn Fn(&K, T, T) -> anyhow::Result<T> + Send + Sync>;

/// Computes the new value of a pipeline variable from its current value and a batch
pub type UpdateFn<K, T> = Arc<dyn Fn(&Value, &Batch<K, T>) -> Value + Send + Sync>;

/// How per-item work is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Items are processed one after another on the calling thread
    #[default]
    Sequential,
    /// Items are dispatched to the worker pool; output order is preserved
    Parallel,
}

/// What to do when an action fails on some items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    /// Abort the whole batch
    #[default]
    Fail,
    /// Drop the failing items and carry on
    Skip,
}

/// The operation an action performs
pub enum ActionKind<K: Key, T: Item> {
    /// Invoke with the whole batch and replace it with the result
    Transform(BatchFn<K, T>),

    /// Apply to every item
    Map {
        /// The per-item function
        func: ItemFn<K, T>,
        /// Scheduling of the items
        mode: ExecMode,
    },

    /// Run every arm on a copy of the batch and merge the results per identifier
    Branch {
        /// Downstream sub-queues
        arms: Vec<ActionQueue<K, T>>,
        /// Re-merges the arm outputs
        merge: MergeFn<K, T>,
    },

    /// Replace a pipeline variable, leaving the batch untouched
    Update {
        /// Variable name
        variable: String,
        /// Computes the new value
        func: UpdateFn<K, T>,
    },

    /// Materialize another pipeline for the same identifiers and merge per identifier
    Join {
        /// The joined pipeline
        other: Box<Pipeline<K, T>>,
        /// Combines both items
        merge: JoinFn<K, T>,
    },
}

impl<K: Key, T: Item> Clone for ActionKind<K, T> {
    fn clone(&self) -> Self {
        match self {
            ActionKind::Transform(func) => ActionKind::Transform(Arc::clone(func)),
            ActionKind::Map { func, mode } => ActionKind::Map {
                func: Arc::clone(func),
                mode: *mode,
            },
            ActionKind::Branch { arms, merge } => ActionKind::Branch {
                arms: arms.clone(),
                merge: Arc::clone(merge),
            },
            ActionKind::Update { variable, func } => ActionKind::Update {
                variable: variable.clone(),
                func: Arc::clone(func),
            },
            ActionKind::Join { other, merge } => ActionKind::Join {
                other: other.clone(),
                merge: Arc::clone(merge),
            },
        }
    }
}

/// One recorded operation
pub struct Action<K: Key, T: Item> {
    name: String,
    kind: ActionKind<K, T>,
    on_error: OnError,
}

impl<K: Key, T: Item> Action<K, T> {
    /// Build an action from its parts
    pub fn new(name: impl Into<String>, kind: ActionKind<K, T>) -> Self {
        Self {
            name: name.into(),
            kind,
            on_error: OnError::Fail,
        }
    }

    /// A whole-batch transformation
    pub fn transform<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Batch<K, T>) -> anyhow::Result<Batch<K, T>> + Send + Sync + 'static,
    {
        Self::new(name, ActionKind::Transform(Arc::new(func)))
    }

    /// A per-item map with the given execution mode
    pub fn map_with<F>(name: impl Into<String>, mode: ExecMode, func: F) -> Self
    where
        F: Fn(&K, T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::new(
            name,
            ActionKind::Map {
                func: Arc::new(func),
                mode,
            },
        )
    }

    /// A per-item map run on the calling thread
    pub fn map<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&K, T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::map_with(name, ExecMode::Sequential, func)
    }

    /// A per-item map dispatched to the worker pool
    pub fn par_map<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&K, T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::map_with(name, ExecMode::Parallel, func)
    }

    /// Fan the batch out to `arms` and merge their outputs per identifier
    pub fn branch<F>(name: impl Into<String>, arms: Vec<ActionQueue<K, T>>, merge: F) -> Self
    where
        F: Fn(&K, Vec<T>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::new(
            name,
            ActionKind::Branch {
                arms,
                merge: Arc::new(merge),
            },
        )
    }

    /// Replace variable `variable` with `func(current, batch)` for every batch
    pub fn update_variable<F>(variable: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Value, &Batch<K, T>) -> Value + Send + Sync + 'static,
    {
        let variable = variable.into();
        Self::new(
            format!("update_variable({variable})"),
            ActionKind::Update {
                variable,
                func: Arc::new(func),
            },
        )
    }

    /// Join with `other`, merging items of the same identifier
    pub fn join<F>(other: Pipeline<K, T>, merge: F) -> Self
    where
        F: Fn(&K, T, T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::new(
            "join",
            ActionKind::Join {
                other: Box::new(other),
                merge: Arc::new(merge),
            },
        )
    }

    /// The same action with failing items dropped instead of failing the batch
    #[must_use]
    pub fn skip_on_error(mut self) -> Self {
        self.on_error = OnError::Skip;
        self
    }

    /// The same action with the given error policy
    #[must_use]
    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    /// Action name, used in error reports
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The recorded operation
    pub fn kind(&self) -> &ActionKind<K, T> {
        &self.kind
    }

    /// Error policy
    pub fn error_policy(&self) -> OnError {
        self.on_error
    }

    /// Short tag of the operation
    pub fn tag(&self) -> &'static str {
        match self.kind {
            ActionKind::Transform(_) => "transform",
            ActionKind::Map { mode: ExecMode::Sequential, .. } => "map",
            ActionKind::Map { mode: ExecMode::Parallel, .. } => "par_map",
            ActionKind::Branch { .. } => "branch",
            ActionKind::Update { .. } => "update_variable",
            ActionKind::Join { .. } => "join",
        }
    }
}

impl<K: Key, T: Item> Clone for Action<K, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            kind: self.kind.clone(),
            on_error: self.on_error,
        }
    }
}

impl<K: Key, T: Item> fmt::Debug for Action<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("tag", &self.tag())
            .field("on_error", &self.on_error)
            .finish()
    }
}

/// Ordered, append-only sequence of actions.
///
/// Appending copies the queue, so values already handed to running
/// iterators never observe later appends.
pub struct ActionQueue<K: Key, T: Item> {
    actions: Arc<Vec<Action<K, T>>>,
}

impl<K: Key, T: Item> ActionQueue<K, T> {
    /// An empty queue
    pub fn new() -> Self {
        Self {
            actions: Arc::new(Vec::new()),
        }
    }

    /// A new queue with `action` appended
    #[must_use]
    pub fn then(&self, action: Action<K, T>) -> Self {
        let mut actions = Vec::with_capacity(self.actions.len() + 1);
        actions.extend(self.actions.iter().cloned());
        actions.push(action);
        Self {
            actions: Arc::new(actions),
        }
    }

    /// A new queue whose last action is replaced by `f(last)`; an empty
    /// queue is returned unchanged
    #[must_use]
    pub fn with_last<F>(&self, f: F) -> Self
    where
        F: FnOnce(Action<K, T>) -> Action<K, T>,
    {
        let Some((last, head)) = self.actions.split_last() else {
            return self.clone();
        };
        let mut actions: Vec<Action<K, T>> = head.to_vec();
        actions.push(f(last.clone()));
        Self {
            actions: Arc::new(actions),
        }
    }

    /// The recorded actions, in order
    pub fn actions(&self) -> &[Action<K, T>] {
        &self.actions
    }

    /// Number of recorded actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no action is recorded
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl<K: Key, T: Item> Default for ActionQueue<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, T: Item> Clone for ActionQueue<K, T> {
    fn clone(&self) -> Self {
        Self {
            actions: Arc::clone(&self.actions),
        }
    }
}

impl<K: Key, T: Item> fmt::Debug for ActionQueue<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.actions.iter()).finish()
    }
}

/// A handler stored in an [`ActionRegistry`]
pub enum Handler<K: Key, T: Item> {
    /// Whole-batch handler
    Batch(BatchFn<K, T>),
    /// Per-item handler
    Item(ItemFn<K, T>),
}

impl<K: Key, T: Item> Clone for Handler<K, T> {
    fn clone(&self) -> Self {
        match self {
            Handler::Batch(f) => Handler::Batch(Arc::clone(f)),
            Handler::Item(f) => Handler::Item(Arc::clone(f)),
        }
    }
}

/// Named handlers that pipelines can refer to by name
pub struct ActionRegistry<K: Key, T: Item> {
    handlers: HashMap<String, Handler<K, T>>,
}

impl<K: Key, T: Item> ActionRegistry<K, T> {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a whole-batch handler, replacing any handler of that name
    pub fn register_transform<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(Batch<K, T>) -> anyhow::Result<Batch<K, T>> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Handler::Batch(Arc::new(func)));
        self
    }

    /// Register a per-item handler, replacing any handler of that name
    pub fn register_map<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(&K, T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Handler::Item(Arc::new(func)));
        self
    }

    /// Whether a handler named `name` exists
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Build the action for handler `name`.
    ///
    /// `mode` applies to per-item handlers; whole-batch handlers always run
    /// sequentially.
    pub fn action(&self, name: &str, mode: ExecMode) -> Result<Action<K, T>> {
        match self.handlers.get(name) {
            Some(Handler::Batch(func)) => Ok(Action::new(name, ActionKind::Transform(Arc::clone(func)))),
            Some(Handler::Item(func)) => Ok(Action::new(
                name,
                ActionKind::Map {
                    func: Arc::clone(func),
                    mode,
                },
            )),
            None => Err(Error::config(format!("no handler registered under '{name}'"))),
        }
    }
}

impl<K: Key, T: Item> Default for ActionRegistry<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appending_never_touches_the_original_queue() {
        let base: ActionQueue<u32, u32> = ActionQueue::new().then(Action::map("inc", |_, x| Ok(x + 1)));
        let longer = base.then(Action::par_map("double", |_, x| Ok(x * 2)));
        assert_eq!(base.len(), 1);
        assert_eq!(longer.len(), 2);
        assert_eq!(longer.actions()[1].tag(), "par_map");
    }

    #[test]
    fn skip_on_error_sets_the_policy() {
        let action: Action<u32, u32> = Action::map("inc", |_, x| Ok(x + 1)).skip_on_error();
        assert_eq!(action.error_policy(), OnError::Skip);
        assert_eq!(action.name(), "inc");

        let queue: ActionQueue<u32, u32> = ActionQueue::new().then(Action::map("inc", |_, x| Ok(x + 1)));
        let skipping = queue.with_last(Action::skip_on_error);
        assert_eq!(queue.actions()[0].error_policy(), OnError::Fail);
        assert_eq!(skipping.actions()[0].error_policy(), OnError::Skip);
        assert!(ActionQueue::<u32, u32>::new().with_last(Action::skip_on_error).is_empty());
    }

    #[test]
    fn registry_builds_actions_by_name() {
        let mut registry: ActionRegistry<u32, u32> = ActionRegistry::new();
        registry
            .register_map("square", |_, x| Ok(x * x))
            .register_transform("noop", Ok);
        assert!(registry.contains("square"));
        assert_eq!(registry.action("square", ExecMode::Parallel).unwrap().tag(), "par_map");
        assert_eq!(registry.action("noop", ExecMode::Parallel).unwrap().tag(), "transform");
        assert!(matches!(
            registry.action("missing", ExecMode::Sequential),
            Err(Error::Configuration(_))
        ));
    }
}
