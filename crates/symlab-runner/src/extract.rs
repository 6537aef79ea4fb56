use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::SymlabError;
use crate::table::{time_index, Record, Table};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    All,
    Only(BTreeSet<String>),
}

impl FieldSelection {
    pub fn only<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldSelection::Only(fields.into_iter().map(Into::into).collect())
    }

    pub fn none() -> Self {
        FieldSelection::Only(BTreeSet::new())
    }

    pub fn includes(&self, field: &str, time_column: &str) -> bool {
        match self {
            FieldSelection::All => field != time_column,
            FieldSelection::Only(fields) => fields.contains(field),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FieldSelection::Only(fields) if fields.is_empty())
    }
}

fn output_key(prefix: Option<&str>, field: &str) -> String {
    match prefix {
        Some(p) => format!("{}_{}", p, field),
        None => field.to_string(),
    }
}

/// Selected fields of the row at `target`, or of the last row when no target
/// is given. With duplicate rows at `target` the last one wins.
///
/// Callers resolve `target` against the run's primary file first; a target
/// with no matching row here is a [`SymlabError::MissingTimeIndex`].
pub fn extract_summary_row(
    table: &Table,
    file: &str,
    time_column: &str,
    target: Option<i64>,
    selection: &FieldSelection,
    prefix: Option<&str>,
) -> Result<Record> {
    let mut selected = None;
    for row in &table.rows {
        match target {
            None => selected = Some(row),
            Some(t) => {
                if time_index(row, time_column)? == t {
                    selected = Some(row);
                }
            }
        }
    }
    let row = selected.ok_or_else(|| SymlabError::MissingTimeIndex {
        file: file.to_string(),
        index: target.map(|t| t.to_string()).unwrap_or_else(|| "<last>".to_string()),
    })?;

    Ok(row
        .iter()
        .filter(|(field, _)| selection.includes(field, time_column))
        .map(|(field, value)| (output_key(prefix, field), value.clone()))
        .collect())
}

pub fn add_time_series_fields(
    table: &Table,
    time_column: &str,
    series: &mut BTreeMap<i64, Record>,
    selection: &FieldSelection,
    prefix: Option<&str>,
) -> Result<()> {
    if selection.is_empty() {
        return Ok(());
    }
    for row in &table.rows {
        let Some(record) = series.get_mut(&time_index(row, time_column)?) else {
            continue;
        };
        for (field, value) in row {
            if selection.includes(field, time_column) {
                record.insert(output_key(prefix, field), value.clone());
            }
        }
    }
    Ok(())
}
