//! Per-item fault isolation.

use crate::stats::ProgressStats;
use crate::step::{Item, Step, StepError};
use crate::store::{LogEntry, LogType, Store};
use crate::value::Value;
use std::any::Any;
use std::error::Error as _;
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

/// What a step sees while processing one item.
pub struct ItemContext<'a> {
    store: &'a Store,
    stats: &'a mut ProgressStats,
    step: &'a str,
    item: &'a Item,
}

impl<'a> ItemContext<'a> {
    /// The store this item's output goes to (the main store or a shard).
    pub fn store(&self) -> &'a Store {
        self.store
    }

    pub fn stats(&self) -> &ProgressStats {
        &*self.stats
    }

    /// Count this item as `units` of progress instead of one.
    pub fn set_progress(&mut self, units: u64) {
        self.stats.progress = units;
    }

    pub fn log_info(
        &mut self,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Result<(), StepError> {
        self.log(LogType::Info, message.into(), details)
    }

    /// Record a warning about this item and count it.
    pub fn log_warning(
        &mut self,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Result<(), StepError> {
        self.stats.warning_count += 1;
        self.log(LogType::Warning, message.into(), details)
    }

    fn log(&self, kind: LogType, message: String, details: Option<Value>) -> Result<(), StepError> {
        let mut entry = LogEntry::new(kind, message)
            .step(self.step)
            .item(self.item.payload().clone());
        entry.details = details;
        self.store.log(&entry)?;
        Ok(())
    }
}

/// Runs a step's `process_item` with fault isolation.
///
/// An error returned by the step, or a panic inside it, becomes an `error`
/// row in the store and one count in `error_count`. Nothing escapes `handle`.
pub struct ItemHandler<'a> {
    step: &'a dyn Step,
    store: &'a Store,
    stats: ProgressStats,
}

impl<'a> ItemHandler<'a> {
    pub fn new(step: &'a dyn Step, store: &'a Store) -> Self {
        Self {
            step,
            store,
            stats: ProgressStats::default(),
        }
    }

    pub fn handle(&mut self, item: &Item) -> ProgressStats {
        self.stats.reset();

        let step = self.step;
        let store = self.store;
        let stats = &mut self.stats;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = ItemContext {
                store,
                stats,
                step: step.name(),
                item,
            };
            step.process_item(item, &mut ctx)
        }));

        let exception = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(describe_error(&e)),
            Err(payload) => Some(format!("panic: {}", panic_message(payload.as_ref()))),
        };

        if let Some(exception) = exception {
            self.stats.error_count += 1;
            let entry = LogEntry::new(LogType::Error, "Failed to process item")
                .step(step.name())
                .exception(exception.as_str())
                .item(item.payload().clone());
            if let Err(e) = self.store.log(&entry) {
                error!(step = step.name(), %exception, "could not record item failure: {e}");
            }
        }

        self.stats
    }
}

/// The error and its source chain, outermost first.
fn describe_error(err: &StepError) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        // Wrapping variants already print their source.
        let cause_text = cause.to_string();
        if !text.ends_with(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Schema;
    use crate::value::{Record, RecordExt};

    struct Users;

    impl Step for Users {
        fn name(&self) -> &str {
            "users"
        }

        fn process_item(&self, item: &Item, ctx: &mut ItemContext<'_>) -> Result<(), StepError> {
            let id = item
                .field("id")
                .and_then(Value::as_key)
                .ok_or_else(|| StepError::MissingField("id".into()))?;
            if id == "13" {
                panic!("unlucky row");
            }
            if item.field("email").is_none() {
                ctx.log_warning("user without email", None)?;
            }
            if let Some(n) = item.field("batch").and_then(Value::as_i64) {
                ctx.set_progress(n as u64);
            }
            ctx.store().put_record("users", &id, item.payload())?;
            Ok(())
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> Store {
        Store::open(dir.path().join("main.db"), Schema::core()).unwrap()
    }

    #[test]
    fn test_successful_item() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut handler = ItemHandler::new(&Users, &store);

        let item = Item::new(Record::new().with("id", 1i64).with("email", "a@x"));
        let stats = handler.handle(&item);

        assert_eq!(stats, ProgressStats::default());
        assert_eq!(store.count_records("users").unwrap(), 1);
    }

    #[test]
    fn test_error_is_recorded_not_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut handler = ItemHandler::new(&Users, &store);

        let item = Item::new(Record::new().with("name", "no id"));
        let stats = handler.handle(&item);

        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.progress, 1);
        let errors = store.log_entries(Some(LogType::Error)).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].step.as_deref(), Some("users"));
        assert_eq!(errors[0].exception.as_deref(), Some("missing field: id"));
        assert_eq!(errors[0].item.as_ref(), Some(item.payload()));
    }

    #[test]
    fn test_panic_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut handler = ItemHandler::new(&Users, &store);

        let stats = handler.handle(&Item::new(Record::new().with("id", 13i64)));
        assert_eq!(stats.error_count, 1);
        let errors = store.log_entries(Some(LogType::Error)).unwrap();
        assert_eq!(errors[0].exception.as_deref(), Some("panic: unlucky row"));

        // The handler keeps working after a panic.
        let stats = handler.handle(&Item::new(Record::new().with("id", 14i64).with("email", "e")));
        assert_eq!(stats.error_count, 0);
        assert_eq!(store.count_records("users").unwrap(), 1);
    }

    #[test]
    fn test_stats_reset_between_items() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut handler = ItemHandler::new(&Users, &store);

        let first = handler.handle(&Item::new(Record::new().with("id", 1i64).with("batch", 5i64)));
        assert_eq!(first.progress, 5);
        assert_eq!(first.warning_count, 1);

        let second = handler.handle(&Item::new(Record::new().with("id", 2i64).with("email", "b")));
        assert_eq!(second, ProgressStats::default());

        let warnings = store.log_entries(Some(LogType::Warning)).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].message, "user without email");
    }
}
