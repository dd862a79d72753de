//! Multi-round sampling over a commit's rows
//!
//! Sampling reads a commit's manifest joined to the row store and produces
//! derived commits: each round samples the previous round's output (the
//! source commit for round one) and persists the selection as a new commit
//! parented on its input. Existing commits, manifests, rows and refs are
//! never mutated; only an explicitly requested target ref is created or
//! reset to the final derived commit.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::collections::BTreeMap;

use crate::database::unit_of_work::UnitOfWork;
use crate::database::{CommitRepository, JobRepository, RefRepository};
use crate::error::{DomainError, DomainResult};
use crate::events::{event_types, DomainEvent, EventBus};
use crate::models::{AnalysisRun, CommitSchema, ManifestEntry, RunStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    pub table_key: String,
    pub rounds: Vec<RoundSpec>,
    /// Optional derived ref created (or reset) to point at the final round's
    /// commit.
    pub target_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RoundSpec {
    Random {
        size: usize,
        seed: Option<u64>,
    },
    Systematic {
        size: usize,
        /// Offset of the first selected row within the sampling interval.
        start: Option<u64>,
    },
    Stratified {
        size: usize,
        strata_columns: Vec<String>,
        seed: Option<u64>,
    },
    Cluster {
        cluster_column: String,
        clusters: usize,
        seed: Option<u64>,
    },
}

impl RoundSpec {
    fn method_name(&self) -> &'static str {
        match self {
            Self::Random { .. } => "random",
            Self::Systematic { .. } => "systematic",
            Self::Stratified { .. } => "stratified",
            Self::Cluster { .. } => "cluster",
        }
    }

    fn validate(&self) -> DomainResult<()> {
        let ok = match self {
            Self::Random { size, .. } | Self::Systematic { size, .. } => *size > 0,
            Self::Stratified {
                size,
                strata_columns,
                ..
            } => *size > 0 && !strata_columns.is_empty(),
            Self::Cluster {
                cluster_column,
                clusters,
                ..
            } => *clusters > 0 && !cluster_column.is_empty(),
        };
        if ok {
            Ok(())
        } else {
            Err(DomainError::Validation(format!(
                "invalid {} sampling round parameters",
                self.method_name()
            )))
        }
    }
}

/// Cell rendered for grouping: strata and cluster keys compare by the
/// canonical text of the value.
fn group_key(row: &Value, columns: &[String]) -> String {
    columns
        .iter()
        .map(|col| match row.get(col) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Select row positions for one round. Returned indices are sorted so the
/// derived manifest keeps the input order.
fn select_round(spec: &RoundSpec, rows: &[Value]) -> Vec<usize> {
    let n = rows.len();
    if n == 0 {
        return Vec::new();
    }

    let mut selected: Vec<usize> = match spec {
        RoundSpec::Random { size, seed } => {
            let mut rng = StdRng::seed_from_u64(seed.unwrap_or(0));
            let k = (*size).min(n);
            let mut all: Vec<usize> = (0..n).collect();
            all.shuffle(&mut rng);
            all.truncate(k);
            all
        }
        RoundSpec::Systematic { size, start } => {
            let k = (*size).min(n);
            let interval = (n / k).max(1);
            let first = (start.unwrap_or(0) as usize) % interval;
            (0..k).map(|i| first + i * interval).filter(|i| *i < n).collect()
        }
        RoundSpec::Stratified {
            size,
            strata_columns,
            seed,
        } => {
            let mut rng = StdRng::seed_from_u64(seed.unwrap_or(0));
            let k = (*size).min(n);

            let mut strata: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (i, row) in rows.iter().enumerate() {
                strata.entry(group_key(row, strata_columns)).or_default().push(i);
            }

            // Proportional allocation with the remainder going to the
            // largest strata first.
            let mut allocations: Vec<(&String, &Vec<usize>, usize)> = strata
                .iter()
                .map(|(key, members)| (key, members, k * members.len() / n))
                .collect();
            let allocated: usize = allocations.iter().map(|(_, _, a)| a).sum();
            let mut remainder = k - allocated;
            allocations.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(b.0)));
            for allocation in allocations.iter_mut() {
                if remainder == 0 {
                    break;
                }
                if allocation.2 < allocation.1.len() {
                    allocation.2 += 1;
                    remainder -= 1;
                }
            }

            let mut picked = Vec::with_capacity(k);
            for (_, members, take) in allocations {
                let mut members = members.clone();
                members.shuffle(&mut rng);
                picked.extend(members.into_iter().take(take));
            }
            picked
        }
        RoundSpec::Cluster {
            cluster_column,
            clusters,
            seed,
        } => {
            let mut rng = StdRng::seed_from_u64(seed.unwrap_or(0));
            let columns = vec![cluster_column.clone()];

            let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (i, row) in rows.iter().enumerate() {
                groups.entry(group_key(row, &columns)).or_default().push(i);
            }

            let mut keys: Vec<&String> = groups.keys().collect();
            keys.shuffle(&mut rng);

            keys.into_iter()
                .take(*clusters)
                .flat_map(|key| groups[key].iter().copied().collect::<Vec<_>>())
                .collect()
        }
    };

    selected.sort_unstable();
    selected.dedup();
    selected
}

#[derive(Clone)]
pub struct SamplingService {
    pool: PgPool,
    bus: EventBus,
}

impl SamplingService {
    pub fn new(pool: PgPool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    /// Execute one claimed sampling job.
    pub async fn run_job(&self, job: &AnalysisRun) -> DomainResult<Value> {
        let params: SamplingParams = serde_json::from_value(job.run_parameters.clone())
            .map_err(|e| DomainError::Validation(format!("bad sampling parameters: {e}")))?;

        if params.rounds.is_empty() {
            return Err(DomainError::Validation("at least one sampling round is required".into()));
        }
        for round in &params.rounds {
            round.validate()?;
        }

        let source_commit_id = job
            .source_commit_id
            .clone()
            .ok_or_else(|| DomainError::Validation("sampling requires a source commit".into()))?;

        let source_schema = CommitRepository::get_schema(&self.pool, &source_commit_id)
            .await?
            .unwrap_or_default();
        let mut scoped_schema = CommitSchema::default();
        if let Some(table) = source_schema.tables.get(&params.table_key) {
            scoped_schema
                .tables
                .insert(params.table_key.clone(), table.clone());
        }

        // Materialize the table's rows page by page; sampling needs the
        // full population in hand.
        let mut population: Vec<(ManifestEntry, Value)> = Vec::new();
        let mut offset = 0i64;
        const PAGE: i64 = 10_000;
        loop {
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
            let mut rows = crate::database::RowStore::get_rows(&self.pool, &hashes).await?;
            for entry in entries {
                let data = rows.remove(&entry.row_hash).unwrap_or(Value::Null);
                population.push((entry, data));
            }
        }

        let mut current = population;
        let mut parent = source_commit_id.clone();
        let mut round_summaries = Vec::with_capacity(params.rounds.len());

        for (round_no, spec) in params.rounds.iter().enumerate() {
            match JobRepository::heartbeat(&self.pool, job.id).await? {
                Some(RunStatus::Cancelled) => {
                    return Ok(json!({"cancelled_after_round": round_no}));
                }
                Some(RunStatus::Running) => {}
                other => {
                    return Err(DomainError::Transient(format!(
                        "job left running state unexpectedly: {other:?}"
                    )));
                }
            }

            let input_rows = current.len();
            let values: Vec<Value> = current.iter().map(|(_, v)| v.clone()).collect();
            let selected = select_round(spec, &values);

            let sample: Vec<(ManifestEntry, Value)> =
                selected.iter().map(|&i| current[i].clone()).collect();

            let commit = self
                .persist_round(job, &params.table_key, &parent, round_no, spec, &sample, &scoped_schema)
                .await?;

            round_summaries.push(json!({
                "round": round_no + 1,
                "method": spec.method_name(),
                "input_rows": input_rows,
                "output_rows": sample.len(),
                "commit_id": commit,
            }));

            parent = commit;
            current = sample;
        }

        if let Some(target_ref) = &params.target_ref {
            self.point_target_ref(job, target_ref, &parent).await?;
        }

        Ok(json!({
            "final_commit_id": parent,
            "row_count": current.len(),
            "rounds": round_summaries,
            "target_ref": params.target_ref,
        }))
    }

    /// Persist one round's selection as a derived commit parented on the
    /// round's input commit.
    #[allow(clippy::too_many_arguments)]
    async fn persist_round(
        &self,
        job: &AnalysisRun,
        table_key: &str,
        parent: &str,
        round_no: usize,
        spec: &RoundSpec,
        sample: &[(ManifestEntry, Value)],
        schema: &CommitSchema,
    ) -> DomainResult<String> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;

        let message = format!(
            "sampling round {} ({}) of job {}",
            round_no + 1,
            spec.method_name(),
            job.id
        );

        let commit = CommitRepository::create_commit(
            uow.tx(),
            job.dataset_id,
            Some(parent),
            &message,
            job.user_id,
            chrono::Utc::now(),
            uuid::Uuid::new_v4(),
        )
        .await?;

        // Re-index the selection 1..n; row hashes already exist in the
        // store, so the derived manifest adds no new blobs.
        let entries: Vec<ManifestEntry> = sample
            .iter()
            .enumerate()
            .map(|(i, (entry, _))| ManifestEntry {
                table_key: table_key.to_string(),
                row_index: (i + 1) as i64,
                row_hash: entry.row_hash.clone(),
            })
            .collect();

        CommitRepository::insert_manifest_entries(uow.tx(), &commit.commit_id, &entries).await?;
        CommitRepository::store_schema(uow.tx(), &commit.commit_id, schema).await?;

        uow.commit().await?;
        Ok(commit.commit_id)
    }

    /// Create the derived ref, or reset it if it already exists (an
    /// explicit branch-reset; ancestry monotonicity does not apply here).
    async fn point_target_ref(
        &self,
        job: &AnalysisRun,
        target_ref: &str,
        commit_id: &str,
    ) -> DomainResult<()> {
        if target_ref == crate::models::MAIN_REF {
            return Err(DomainError::BusinessRule(
                "sampling may not retarget the main ref".into(),
            ));
        }

        let mut uow = UnitOfWork::begin(&self.pool).await?;

        let existing = RefRepository::resolve(&self.pool, job.dataset_id, target_ref).await?;
        match existing {
            None => {
                RefRepository::create_ref(uow.tx(), job.dataset_id, target_ref, Some(commit_id))
                    .await?;
            }
            Some(_) => {
                RefRepository::set_ref(uow.tx(), job.dataset_id, target_ref, Some(commit_id))
                    .await?;
            }
        }

        uow.collect(DomainEvent::new(
            event_types::DATASET_COMMITTED,
            "dataset",
            job.dataset_id,
            Some(job.user_id),
            json!({"commit_id": commit_id, "ref": target_ref, "job_id": job.id}),
        ));

        let events = uow.commit().await?;
        self.bus.publish_all(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(n: usize) -> Vec<Value> {
        (0..n)
            .map(|i| json!({"id": i.to_string(), "grp": (i % 3).to_string()}))
            .collect()
    }

    #[test]
    fn test_random_is_seed_deterministic() {
        let population = rows(100);
        let spec = RoundSpec::Random {
            size: 10,
            seed: Some(7),
        };
        let a = select_round(&spec, &population);
        let b = select_round(&spec, &population);
        assert_eq!(a, b, "same seed must select the same rows");
        assert_eq!(a.len(), 10);
        assert!(a.windows(2).all(|w| w[0] < w[1]), "selection must be sorted");
    }

    #[test]
    fn test_random_size_larger_than_population() {
        let population = rows(5);
        let spec = RoundSpec::Random {
            size: 50,
            seed: Some(1),
        };
        assert_eq!(select_round(&spec, &population).len(), 5);
    }

    #[test]
    fn test_systematic_every_kth() {
        let population = rows(100);
        let spec = RoundSpec::Systematic {
            size: 10,
            start: Some(3),
        };
        let selected = select_round(&spec, &population);
        assert_eq!(selected.len(), 10);
        assert_eq!(selected[0], 3);
        assert!(selected.windows(2).all(|w| w[1] - w[0] == 10));
    }

    #[test]
    fn test_stratified_covers_every_stratum() {
        let population = rows(90); // three equal strata of 30
        let spec = RoundSpec::Stratified {
            size: 9,
            strata_columns: vec!["grp".into()],
            seed: Some(11),
        };
        let selected = select_round(&spec, &population);
        assert_eq!(selected.len(), 9);

        let mut per_stratum = std::collections::HashMap::new();
        for i in &selected {
            *per_stratum
                .entry(population[*i]["grp"].as_str().unwrap().to_string())
                .or_insert(0usize) += 1;
        }
        assert_eq!(per_stratum.len(), 3, "every stratum must be represented");
        assert!(per_stratum.values().all(|&c| c == 3), "equal strata get equal allocation");
    }

    #[test]
    fn test_cluster_takes_whole_groups() {
        let population = rows(30); // clusters of 10 by grp
        let spec = RoundSpec::Cluster {
            cluster_column: "grp".into(),
            clusters: 1,
            seed: Some(3),
        };
        let selected = select_round(&spec, &population);
        assert_eq!(selected.len(), 10, "one whole cluster");

        let groups: std::collections::HashSet<&str> = selected
            .iter()
            .map(|i| population[*i]["grp"].as_str().unwrap())
            .collect();
        assert_eq!(groups.len(), 1, "all selected rows share the cluster value");
    }

    #[test]
    fn test_empty_population_selects_nothing() {
        let spec = RoundSpec::Random {
            size: 10,
            seed: None,
        };
        assert!(select_round(&spec, &[]).is_empty());
    }

    #[test]
    fn test_round_validation() {
        assert!(RoundSpec::Random { size: 0, seed: None }.validate().is_err());
        assert!(RoundSpec::Stratified {
            size: 5,
            strata_columns: vec![],
            seed: None
        }
        .validate()
        .is_err());
        assert!(RoundSpec::Cluster {
            cluster_column: "g".into(),
            clusters: 2,
            seed: None
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_params_deserialize_tagged_methods() {
        let params: SamplingParams = serde_json::from_value(json!({
            "table_key": "primary",
            "rounds": [
                {"method": "random", "size": 100, "seed": 42},
                {"method": "stratified", "size": 10, "strata_columns": ["region"]},
            ],
            "target_ref": "sample/v1",
        }))
        .unwrap();

        assert_eq!(params.rounds.len(), 2);
        assert!(matches!(params.rounds[0], RoundSpec::Random { size: 100, seed: Some(42) }));
    }
}
