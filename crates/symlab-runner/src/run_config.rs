use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use std::path::Path;

use crate::error::SymlabError;
use crate::table::Table;

#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    run: String,
    params: IndexMap<String, String>,
}

impl RunConfig {
    pub fn load(run: &str, path: &Path) -> Result<Self> {
        let table = Table::read(path)?;
        for column in ["parameter", "value"] {
            if !table.headers.iter().any(|h| h == column) {
                return Err(anyhow!(
                    "run config {} has no '{}' column",
                    path.display(),
                    column
                ));
            }
        }
        let params = table
            .rows
            .into_iter()
            .map(|mut row| {
                let param = row.swap_remove("parameter").unwrap_or_default();
                let value = row.swap_remove("value").unwrap_or_default();
                (param, value)
            })
            .collect();
        Ok(Self {
            run: run.to_string(),
            params,
        })
    }

    pub fn from_pairs<I, K, V>(run: &str, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            run: run.to_string(),
            params: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|v| v.as_str())
    }

    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name).ok_or_else(|| {
            SymlabError::MissingParameter {
                run: self.run.clone(),
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn require_int(&self, name: &str) -> Result<i64> {
        let raw = self.require(name)?;
        raw.trim()
            .parse::<i64>()
            .with_context(|| format!("run {}: {} is not an integer: '{}'", self.run, name, raw))
    }

    pub fn max_pop_size(&self) -> Result<i64> {
        let pop_size = self.require_int("POP_SIZE")?;
        if pop_size == -1 {
            let (x, y) = (self.require_int("GRID_X")?, self.require_int("GRID_Y")?);
            x.checked_mul(y).ok_or_else(|| {
                anyhow!("run {}: GRID_X * GRID_Y overflows ({} x {})", self.run, x, y)
            })
        } else {
            Ok(pop_size)
        }
    }
}
