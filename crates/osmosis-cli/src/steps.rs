//! Steps built from the definition file.

use crate::config::{Config, StepConfig};
use anyhow::{Result, bail};
use indexmap::IndexMap;
use rhi_osmosis_core::{Item, ItemContext, Items, Record, Step, StepError, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::vec;

/// Longest excerpt of an unparseable row kept in its error message.
const EXCERPT_LEN: usize = 80;

/// Imports JSON Lines rows as normalized records of one kind.
#[derive(Debug)]
pub struct JsonlImportStep {
    name: String,
    title: String,
    sources: Vec<PathBuf>,
    kind: String,
    key: String,
    parallel: bool,
    percent: bool,
    count: bool,
    required: Vec<String>,
    rename: IndexMap<String, String>,
    drop: Vec<String>,
}

impl JsonlImportStep {
    /// Build from a step definition; relative sources resolve against the config file.
    pub fn from_config(step: &StepConfig, config: &Config) -> Self {
        Self {
            name: step.name.clone(),
            title: step.title.clone().unwrap_or_else(|| step.name.clone()),
            sources: step
                .sources
                .iter()
                .map(|s| config.resolve(Path::new(s)))
                .collect(),
            kind: step.kind.clone().unwrap_or_else(|| step.name.clone()),
            key: step.key.clone(),
            parallel: step.parallel,
            percent: step.percent,
            count: step.count,
            required: step.required.clone(),
            rename: step.rename.clone(),
            drop: step.drop.clone(),
        }
    }

    /// Expand source patterns into existing files, sorted within each pattern.
    pub fn files(&self) -> Result<Vec<PathBuf>, StepError> {
        let mut files = Vec::new();
        for source in &self.sources {
            let pattern = source.to_string_lossy();
            let mut matched: Vec<PathBuf> = glob::glob(&pattern)
                .map_err(|e| StepError::failed(format!("invalid source pattern '{pattern}': {e}")))?
                .filter_map(|entry| entry.ok())
                .filter(|p| p.is_file())
                .collect();
            if matched.is_empty() {
                tracing::warn!(step = %self.name, %pattern, "source matched no files");
            }
            matched.sort();
            files.extend(matched);
        }
        Ok(files)
    }

    fn normalize(&self, row: &Record) -> Record {
        row.iter()
            .filter(|(field, _)| !self.drop.contains(*field))
            .map(|(field, value)| {
                let name = self.rename.get(field).unwrap_or(field);
                (name.clone(), value.clone())
            })
            .collect()
    }
}

impl Step for JsonlImportStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn title(&self) -> String {
        self.title.clone()
    }

    fn parallelizable(&self) -> bool {
        self.parallel
    }

    fn report_progress_in_percent(&self) -> bool {
        self.percent
    }

    fn max_progress(&self) -> Result<Option<u64>, StepError> {
        if !self.count {
            return Ok(None);
        }
        let mut total = 0u64;
        for file in self.files()? {
            for line in BufReader::new(File::open(&file)?).lines() {
                if !line?.trim().is_empty() {
                    total += 1;
                }
            }
        }
        Ok(Some(total))
    }

    fn items(&self) -> Result<Items<'_>, StepError> {
        Ok(Box::new(JsonlRows {
            files: self.files()?.into_iter(),
            current: None,
        }))
    }

    fn process_item(&self, item: &Item, ctx: &mut ItemContext<'_>) -> Result<(), StepError> {
        let Some(row) = item.payload().as_object() else {
            return Err(StepError::InvalidItem(format!(
                "expected a JSON object, got {}",
                excerpt(item.payload())
            )));
        };
        let key = row
            .get(&self.key)
            .and_then(Value::as_key)
            .ok_or_else(|| StepError::MissingField(self.key.clone()))?;

        let record = self.normalize(row);
        for field in &self.required {
            if record.get(field).is_none_or(Value::is_null) {
                ctx.log_warning(
                    format!("missing required field '{field}'"),
                    Some(Value::from(field.as_str())),
                )?;
            }
        }
        ctx.store().put_record(&self.kind, &key, &Value::Object(record))?;
        Ok(())
    }
}

fn excerpt(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_json(),
    };
    if text.chars().count() > EXCERPT_LEN {
        let cut: String = text.chars().take(EXCERPT_LEN).collect();
        format!("{cut}...")
    } else {
        text
    }
}

/// Rows of several JSON Lines files, in order.
///
/// A line that is not valid JSON becomes a string item so that it fails
/// (and is logged) on its own instead of ending the step.
struct JsonlRows {
    files: vec::IntoIter<PathBuf>,
    current: Option<Lines<BufReader<File>>>,
}

impl Iterator for JsonlRows {
    type Item = Result<Item, StepError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(lines) = &mut self.current {
                match lines.next() {
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => {
                        let payload = Value::from_json(&line).unwrap_or(Value::String(line));
                        return Some(Ok(Item::new(payload)));
                    }
                    Some(Err(e)) => return Some(Err(e.into())),
                    None => self.current = None,
                }
            }
            let file = self.files.next()?;
            match File::open(&file) {
                Ok(f) => self.current = Some(BufReader::new(f).lines()),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Build the converter's steps, in definition order.
pub fn build_steps(config: &Config) -> Result<Vec<Arc<dyn Step>>> {
    let mut steps: Vec<Arc<dyn Step>> = Vec::with_capacity(config.steps.len());
    for step in &config.steps {
        if step.percent && !step.count {
            bail!("step '{}': percent progress needs count = true", step.name);
        }
        steps.push(Arc::new(JsonlImportStep::from_config(step, config)));
    }
    Ok(steps)
}
