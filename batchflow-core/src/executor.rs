//! Applies an action queue to a materialized batch

use std::collections::{HashMap, HashSet};

use tracing::{trace, warn};

use crate::action::{Action, ActionKind, ActionQueue, ExecMode, ItemFn, OnError};
use crate::batch::{Batch, Item};
use crate::error::{render_ids, Error, Result};
use crate::index::Key;
use crate::pool::WorkerPool;
use crate::schedule::CancelToken;
use crate::variables::Variables;

/// Outcome of one action on one item
type Outcome<K, T> = (K, anyhow::Result<T>);

/// What an executing queue has access to besides the batch
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    /// Workers for parallel maps
    pub pool: &'a WorkerPool,
    /// Variables read and written by update actions
    pub variables: &'a Variables,
    /// Checked between actions
    pub cancel: &'a CancelToken,
}

/// Run every action of `queue` over `batch`, in order.
///
/// Cancellation is checked before each action. The first failing action
/// aborts the batch unless it is marked skip-on-error.
pub fn execute<K: Key, T: Item>(queue: &ActionQueue<K, T>, mut batch: Batch<K, T>, ctx: Context<'_>) -> Result<Batch<K, T>> {
    for (position, action) in queue.actions().iter().enumerate() {
        ctx.cancel.check()?;
        trace!(position, action = action.name(), kind = action.tag(), items = batch.len(), "applying action");
        batch = apply(position, action, batch, ctx)?;
    }
    Ok(batch)
}

fn apply<K: Key, T: Item>(position: usize, action: &Action<K, T>, batch: Batch<K, T>, ctx: Context<'_>) -> Result<Batch<K, T>> {
    match action.kind() {
        ActionKind::Transform(func) => {
            let ids = batch.ids().to_vec();
            match func(batch) {
                Ok(out) => Ok(out),
                Err(e) => {
                    let outcomes = ids.into_iter().map(|id| (id, Err(anyhow::anyhow!("{e:#}")))).collect();
                    settle(position, action, outcomes)
                }
            }
        }
        ActionKind::Map { func, mode } => {
            let outcomes = map_items(batch, func, *mode, ctx.pool);
            settle(position, action, outcomes)
        }
        ActionKind::Branch { arms, merge } => {
            let run_arms = |input: &Batch<K, T>| -> Result<Vec<HashMap<K, T>>> {
                let mut outputs = Vec::with_capacity(arms.len());
                for (arm, queue) in arms.iter().enumerate() {
                    let out = execute(queue, input.clone(), ctx)
                        .map_err(|e| nested(position, action, &format!("branch arm {arm}"), e))?;
                    outputs.push(out.into_pairs().collect());
                }
                Ok(outputs)
            };
            let Some((batch, mut outputs)) = run_nested(position, action, batch, run_arms)? else {
                return Ok(Batch::empty());
            };
            let mut outcomes = Vec::with_capacity(batch.len());
            for id in batch.ids() {
                let parts: Option<Vec<T>> = outputs.iter_mut().map(|arm| arm.remove(id)).collect();
                match parts {
                    Some(parts) => {
                        let merged = merge(id, parts);
                        outcomes.push((id.clone(), merged));
                    }
                    None => trace!(position, id = ?id, "identifier missing from a branch arm"),
                }
            }
            settle(position, action, outcomes)
        }
        ActionKind::Update { variable, func } => match ctx.variables.update(variable, |current| func(current, &batch)) {
            Ok(()) => Ok(batch),
            Err(e) => {
                let outcomes = batch.into_pairs().map(|(id, _)| (id, Err(anyhow::anyhow!("{e}")))).collect();
                settle(position, action, outcomes)
            }
        },
        ActionKind::Join { other, merge } => {
            let run_other = |input: &Batch<K, T>| {
                other
                    .process(input.ids(), ctx.cancel)
                    .map_err(|e| nested(position, action, "joined pipeline", e))
            };
            let Some((batch, joined)) = run_nested(position, action, batch, run_other)? else {
                return Ok(Batch::empty());
            };
            let mut by_id: HashMap<K, T> = joined.into_pairs().collect();
            let mut outcomes = Vec::with_capacity(batch.len());
            for (id, item) in batch {
                match by_id.remove(&id) {
                    Some(other_item) => {
                        let merged = merge(&id, item, other_item);
                        outcomes.push((id, merged));
                    }
                    None => trace!(position, id = ?id, "identifier dropped by the joined pipeline"),
                }
            }
            settle(position, action, outcomes)
        }
    }
}

/// Run a nested queue (branch arms or a joined pipeline) over `batch`.
///
/// Under skip-on-error the identifiers a nested failure names are dropped and
/// the rest is run again; a failure naming none of the remaining identifiers
/// drops the whole batch. `None` means nothing survived.
fn run_nested<K: Key, T: Item, R>(
    position: usize,
    action: &Action<K, T>,
    mut batch: Batch<K, T>,
    mut run: impl FnMut(&Batch<K, T>) -> Result<R>,
) -> Result<Option<(Batch<K, T>, R)>> {
    loop {
        let err = match run(&batch) {
            Ok(out) => return Ok(Some((batch, out))),
            Err(err) => err,
        };
        let failed: HashSet<String> = match (&err, action.error_policy()) {
            (Error::PipelineExecution { ids, .. }, OnError::Skip) => ids.iter().cloned().collect(),
            _ => return Err(err),
        };
        let before = batch.len();
        batch = batch.retain_ids(|id| !failed.contains(&format!("{id:?}")));
        warn!(
            position,
            action = action.name(),
            dropped = ?failed,
            error = %err,
            "dropping items that failed in a nested pipeline"
        );
        if batch.len() == before || batch.is_empty() {
            return Ok(None);
        }
    }
}

fn map_items<K: Key, T: Item>(
    batch: Batch<K, T>,
    func: &ItemFn<K, T>,
    mode: ExecMode,
    pool: &WorkerPool,
) -> Vec<Outcome<K, T>> {
    let pairs: Vec<(K, T)> = batch.into_pairs().collect();
    let apply = |(id, item): (K, T)| {
        let out = func(&id, item);
        (id, out)
    };
    match mode {
        ExecMode::Sequential => pairs.into_iter().map(apply).collect(),
        ExecMode::Parallel => pool.map_ordered(pairs, apply),
    }
}

/// Rebuild the batch from per-item outcomes under the action's error policy
fn settle<K: Key, T: Item>(position: usize, action: &Action<K, T>, outcomes: Vec<Outcome<K, T>>) -> Result<Batch<K, T>> {
    let mut ids = Vec::with_capacity(outcomes.len());
    let mut items = Vec::with_capacity(outcomes.len());
    let mut failed = Vec::new();
    let mut first_error = None;
    for (id, outcome) in outcomes {
        match outcome {
            Ok(item) => {
                ids.push(id);
                items.push(item);
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(format!("{e:#}"));
                }
                failed.push(id);
            }
        }
    }

    if let Some(message) = first_error {
        match action.error_policy() {
            OnError::Fail => {
                return Err(Error::PipelineExecution {
                    position,
                    action: action.name().to_string(),
                    ids: render_ids(&failed),
                    message,
                })
            }
            OnError::Skip => warn!(
                position,
                action = action.name(),
                dropped = ?render_ids(&failed),
                error = %message,
                "dropping items that failed"
            ),
        }
    }
    Batch::from_parts(ids, items)
}

/// Report a failure inside a branch arm or joined pipeline at the enclosing
/// action's position
fn nested<K: Key, T: Item>(position: usize, action: &Action<K, T>, context: &str, err: Error) -> Error {
    let ids = match &err {
        Error::Cancelled => return Error::Cancelled,
        Error::PipelineExecution { ids, .. } | Error::Load { ids, .. } => ids.clone(),
        _ => Vec::new(),
    };
    Error::PipelineExecution {
        position,
        action: action.name().to_string(),
        ids,
        message: format!("{context}: {err}"),
    }
}
