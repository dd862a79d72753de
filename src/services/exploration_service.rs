//! Table exploration and profiling
//!
//! Computes per-column statistics over a commit's rows. Exploration gives
//! the cheap overview (counts, nulls, distincts, numeric ranges); profiling
//! adds value frequencies and numeric means. Both read the manifest joined
//! to the row store page by page and never mutate anything.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::database::{CommitRepository, JobRepository, RowStore};
use crate::error::{DomainError, DomainResult};
use crate::models::{AnalysisRun, RunStatus};

/// Distinct-value tracking stops at this cardinality and reports the count
/// as a lower bound.
const DISTINCT_CAP: usize = 10_000;
/// Frequency tracking (profiling only) keeps at most this many values.
const FREQUENCY_CAP: usize = 1_000;
const TOP_VALUES: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationParams {
    pub table_key: String,
    /// Optional cap on scanned rows; the default scans the whole table.
    pub max_rows: Option<u64>,
}

#[derive(Default)]
struct ColumnAccumulator {
    present: u64,
    nulls: u64,
    numeric_count: u64,
    numeric_sum: f64,
    numeric_min: Option<f64>,
    numeric_max: Option<f64>,
    text_min: Option<String>,
    text_max: Option<String>,
    distinct: HashSet<String>,
    distinct_overflow: bool,
    frequencies: HashMap<String, u64>,
    frequency_overflow: bool,
}

impl ColumnAccumulator {
    fn observe(&mut self, value: &Value, track_frequencies: bool) {
        if value.is_null() {
            self.nulls += 1;
            return;
        }
        self.present += 1;

        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        // Numeric stats cover native numbers and numeric-looking strings,
        // since CSV cells always arrive as strings.
        let numeric = value.as_f64().or_else(|| rendered.trim().parse::<f64>().ok());
        if let Some(n) = numeric {
            self.numeric_count += 1;
            self.numeric_sum += n;
            self.numeric_min = Some(self.numeric_min.map_or(n, |m| m.min(n)));
            self.numeric_max = Some(self.numeric_max.map_or(n, |m| m.max(n)));
        }

        match &self.text_min {
            Some(current) if *current <= rendered => {}
            _ => self.text_min = Some(rendered.clone()),
        }
        match &self.text_max {
            Some(current) if *current >= rendered => {}
            _ => self.text_max = Some(rendered.clone()),
        }

        if !self.distinct_overflow {
            if self.distinct.len() >= DISTINCT_CAP && !self.distinct.contains(&rendered) {
                self.distinct_overflow = true;
            } else {
                self.distinct.insert(rendered.clone());
            }
        }

        if track_frequencies && !self.frequency_overflow {
            if self.frequencies.len() >= FREQUENCY_CAP && !self.frequencies.contains_key(&rendered)
            {
                self.frequency_overflow = true;
            } else {
                *self.frequencies.entry(rendered).or_insert(0) += 1;
            }
        }
    }

    fn summarize(&self, detailed: bool) -> Value {
        let mut out = Map::new();
        out.insert("count".into(), json!(self.present));
        out.insert("nulls".into(), json!(self.nulls));
        out.insert("distinct".into(), json!(self.distinct.len()));
        out.insert("distinct_is_lower_bound".into(), json!(self.distinct_overflow));

        if self.numeric_count > 0 {
            out.insert("numeric_min".into(), json!(self.numeric_min));
            out.insert("numeric_max".into(), json!(self.numeric_max));
            if detailed {
                out.insert(
                    "numeric_mean".into(),
                    json!(self.numeric_sum / self.numeric_count as f64),
                );
            }
        }
        out.insert("min".into(), json!(self.text_min));
        out.insert("max".into(), json!(self.text_max));

        if detailed {
            let mut top: Vec<(&String, &u64)> = self.frequencies.iter().collect();
            top.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            let top: Vec<Value> = top
                .into_iter()
                .take(TOP_VALUES)
                .map(|(value, count)| json!({"value": value, "count": count}))
                .collect();
            out.insert("top_values".into(), json!(top));
            out.insert("top_values_are_partial".into(), json!(self.frequency_overflow));
        }

        Value::Object(out)
    }
}

fn observe_row(columns: &mut BTreeMap<String, ColumnAccumulator>, row: &Value, detailed: bool) {
    if let Value::Object(fields) = row {
        for (name, value) in fields {
            columns
                .entry(name.clone())
                .or_default()
                .observe(value, detailed);
        }
    }
}

/// Profile an iterator of row objects. Pure; the job path streams manifest
/// pages through the same accumulators.
pub fn profile_rows<'a>(
    rows: impl IntoIterator<Item = &'a Value>,
    detailed: bool,
) -> (u64, BTreeMap<String, ColumnStats>) {
    let mut columns: BTreeMap<String, ColumnAccumulator> = BTreeMap::new();
    let mut row_count = 0u64;

    for row in rows {
        row_count += 1;
        observe_row(&mut columns, row, detailed);
    }

    let stats = columns
        .into_iter()
        .map(|(name, acc)| (name, ColumnStats { summary: acc.summarize(detailed) }))
        .collect();

    (row_count, stats)
}

pub struct ColumnStats {
    pub summary: Value,
}

#[derive(Clone)]
pub struct ExplorationService {
    pool: PgPool,
}

impl ExplorationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Execute one claimed exploration or profiling job. `detailed`
    /// distinguishes profiling (frequencies, means) from exploration.
    pub async fn run_job(&self, job: &AnalysisRun, detailed: bool) -> DomainResult<Value> {
        let params: ExplorationParams = serde_json::from_value(job.run_parameters.clone())
            .map_err(|e| DomainError::Validation(format!("bad exploration parameters: {e}")))?;

        let source_commit_id = job
            .source_commit_id
            .clone()
            .ok_or_else(|| DomainError::Validation("exploration requires a source commit".into()))?;

        let mut columns: BTreeMap<String, ColumnAccumulator> = BTreeMap::new();
        let mut row_count = 0u64;
        let mut offset = 0i64;
        const PAGE: i64 = 10_000;

        'scan: loop {
            match JobRepository::heartbeat(&self.pool, job.id).await? {
                Some(RunStatus::Cancelled) => {
                    return Ok(json!({"cancelled": true, "rows_scanned": row_count}));
                }
                Some(RunStatus::Running) => {}
                other => {
                    return Err(DomainError::Transient(format!(
                        "job left running state unexpectedly: {other:?}"
                    )));
                }
            }

            let entries = CommitRepository::get_manifest(
                &self.pool,
                &source_commit_id,
                Some(&params.table_key),
                offset,
                PAGE,
            )
            .await?;
            if entries.is_empty() {
                break;
            }
            offset += entries.len() as i64;

            let hashes: Vec<String> = entries.iter().map(|e| e.row_hash.clone()).collect();
            let rows = RowStore::get_rows(&self.pool, &hashes).await?;

            for entry in &entries {
                let Some(row) = rows.get(&entry.row_hash) else {
                    continue;
                };
                row_count += 1;
                observe_row(&mut columns, row, detailed);
                if let Some(cap) = params.max_rows {
                    if row_count >= cap {
                        break 'scan;
                    }
                }
            }
        }

        let column_summaries: Map<String, Value> = columns
            .iter()
            .map(|(name, acc)| (name.clone(), acc.summarize(detailed)))
            .collect();

        Ok(json!({
            "table_key": params.table_key,
            "commit_id": source_commit_id,
            "row_count": row_count,
            "columns": column_summaries,
            "profile": detailed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rows() -> Vec<Value> {
        vec![
            json!({"id": "1", "name": "alice", "score": "10"}),
            json!({"id": "2", "name": "bob", "score": "20"}),
            json!({"id": "3", "name": null, "score": "30"}),
            json!({"id": "4", "name": "alice", "score": "oops"}),
        ]
    }

    #[test]
    fn test_profile_counts_and_nulls() {
        let rows = sample_rows();
        let (count, stats) = profile_rows(&rows, false);
        assert_eq!(count, 4);

        let name = &stats["name"].summary;
        assert_eq!(name["count"], 3);
        assert_eq!(name["nulls"], 1);
        assert_eq!(name["distinct"], 2);
    }

    #[test]
    fn test_profile_numeric_stats_from_string_cells() {
        let rows = sample_rows();
        let (_, stats) = profile_rows(&rows, true);

        let score = &stats["score"].summary;
        // "oops" is non-numeric; the three numeric cells drive min/max/mean.
        assert_eq!(score["numeric_min"], 10.0);
        assert_eq!(score["numeric_max"], 30.0);
        assert_eq!(score["numeric_mean"], 20.0);
    }

    #[test]
    fn test_profile_top_values_only_when_detailed() {
        let rows = sample_rows();

        let (_, shallow) = profile_rows(&rows, false);
        assert!(shallow["name"].summary.get("top_values").is_none());

        let (_, detailed) = profile_rows(&rows, true);
        let top = detailed["name"].summary["top_values"].as_array().unwrap();
        assert_eq!(top[0]["value"], "alice");
        assert_eq!(top[0]["count"], 2);
    }

    #[test]
    fn test_profile_empty_input() {
        let (count, stats) = profile_rows(&[], true);
        assert_eq!(count, 0);
        assert!(stats.is_empty());
    }
}
