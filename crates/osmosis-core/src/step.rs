//! Steps: the units of work a converter runs, and the items they consume.

use crate::handler::ItemContext;
use crate::store::{Store, StoreError};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// One immutable unit of input: a source row or a group of related rows.
///
/// Items cross process boundaries by value, so the payload is a
/// self-describing `Value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item(Value);

impl Item {
    pub fn new(payload: impl Into<Value>) -> Self {
        Self(payload.into())
    }

    pub fn payload(&self) -> &Value {
        &self.0
    }

    /// Look up a top-level field when the payload is an object.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.as_object().and_then(|obj| obj.get(name))
    }
}

impl From<Value> for Item {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// A lazy, one-shot item source. Yielding an error ends the step.
pub type Items<'a> = Box<dyn Iterator<Item = Result<Item, StepError>> + 'a>;

/// A unit of pipeline work.
///
/// Steps must be shareable across threads: with the thread launcher, workers
/// call `process_item` concurrently, each against its own shard.
pub trait Step: Send + Sync {
    /// Stable identifier, used to find the step again inside a worker process.
    fn name(&self) -> &str;

    /// Human-readable title for the status line.
    fn title(&self) -> String {
        self.name().to_string()
    }

    /// Whether items may be processed by several workers at once.
    fn parallelizable(&self) -> bool {
        false
    }

    /// Show progress as a percentage (when the total is known).
    fn report_progress_in_percent(&self) -> bool {
        false
    }

    /// One-shot work against the main store before any item is produced.
    fn execute(&self, store: &Store) -> Result<(), StepError> {
        let _ = store;
        Ok(())
    }

    /// Expected number of items, if knowable in advance.
    fn max_progress(&self) -> Result<Option<u64>, StepError> {
        Ok(None)
    }

    /// The step's items. Called once per run; the sequence is not restartable.
    fn items(&self) -> Result<Items<'_>, StepError> {
        Ok(Box::new(std::iter::empty()))
    }

    /// Apply one item to the store in `ctx`.
    fn process_item(&self, item: &Item, ctx: &mut ItemContext<'_>) -> Result<(), StepError> {
        let _ = (item, ctx);
        Ok(())
    }
}

/// Errors raised by a step.
///
/// Errors from `process_item` are recovered per item; errors from `execute`,
/// `max_progress` and `items` fail the step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid item: {0}")]
    InvalidItem(String),

    #[error("missing field: {0}")]
    MissingField(String),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl StepError {
    pub fn failed(msg: impl Into<String>) -> Self {
        StepError::Failed(msg.into())
    }
}
