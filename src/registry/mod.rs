use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

pub mod error;

use error::{RegistryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    Backtest,
    Evaluation,
    Optimization,
}

impl ResultType {
    fn dir_name(self) -> &'static str {
        match self {
            ResultType::Backtest => "backtests",
            ResultType::Evaluation => "evaluations",
            ResultType::Optimization => "optimizations",
        }
    }

    fn tag(self) -> &'static str {
        match self {
            ResultType::Backtest => "backtest",
            ResultType::Evaluation => "evaluation",
            ResultType::Optimization => "optimization",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RunEntry {
    strategy_name: String,
    symbol: String,
    stored_at: String,
    result_types: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Index {
    runs: BTreeMap<String, RunEntry>,
    strategies: BTreeMap<String, Vec<String>>,
    symbols: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    updated_at: String,
}

/// Durable JSON store for backtest/evaluation/optimization payloads.
///
/// Layout: `backtests/`, `evaluations/`, `optimizations/` each holding
/// `{run_id}.json` with a `_metadata` sub-object, plus `index.json` with
/// `runs`/`strategies`/`symbols` maps. The repository is the only writer
/// of the index; every store updates it read-modify-write.
pub struct ResultsRepository {
    base_path: PathBuf,
}

impl ResultsRepository {
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();

        for result_type in [
            ResultType::Backtest,
            ResultType::Evaluation,
            ResultType::Optimization,
        ] {
            let dir = base_path.join(result_type.dir_name());
            fs::create_dir_all(&dir).map_err(|source| RegistryError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }

        let repository = Self { base_path };
        if !repository.index_path().exists() {
            repository.write_index(&Index {
                created_at: Utc::now().to_rfc3339(),
                ..Index::default()
            })?;
        }

        Ok(repository)
    }

    fn index_path(&self) -> PathBuf {
        self.base_path.join("index.json")
    }

    fn payload_path(&self, result_type: ResultType, run_id: &str) -> PathBuf {
        self.base_path
            .join(result_type.dir_name())
            .join(format!("{run_id}.json"))
    }

    fn read_index(&self) -> Result<Index> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Index::default());
        }
        let raw = fs::read_to_string(&path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_index(&self, index: &Index) -> Result<()> {
        let mut index = index.clone();
        index.updated_at = Utc::now().to_rfc3339();

        let path = self.index_path();
        let raw = serde_json::to_string_pretty(&index)?;
        fs::write(&path, raw).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Stores one payload and updates the index atomically with respect to
    /// this (single-writer) repository.
    pub fn store(
        &self,
        result_type: ResultType,
        run_id: &str,
        strategy_name: &str,
        symbol: &str,
        mut payload: Value,
    ) -> Result<String> {
        let storage_id = format!("{}-{run_id}", result_type.tag());

        payload["_metadata"] = json!({
            "storage_id": storage_id,
            "stored_at": Utc::now().to_rfc3339(),
            "result_type": result_type.tag(),
        });

        let path = self.payload_path(result_type, run_id);
        let raw = serde_json::to_string_pretty(&payload)?;
        fs::write(&path, raw).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut index = self.read_index()?;
        let entry = index.runs.entry(run_id.to_string()).or_insert_with(|| RunEntry {
            strategy_name: strategy_name.to_string(),
            symbol: symbol.to_string(),
            stored_at: Utc::now().to_rfc3339(),
            result_types: Vec::new(),
        });
        let tag = result_type.tag().to_string();
        if !entry.result_types.contains(&tag) {
            entry.result_types.push(tag);
        }

        let strategy_runs = index
            .strategies
            .entry(strategy_name.to_string())
            .or_default();
        if !strategy_runs.iter().any(|id| id == run_id) {
            strategy_runs.push(run_id.to_string());
        }

        let symbol_runs = index.symbols.entry(symbol.to_string()).or_default();
        if !symbol_runs.iter().any(|id| id == run_id) {
            symbol_runs.push(run_id.to_string());
        }

        self.write_index(&index)?;

        debug!(storage_id, "results stored");
        Ok(storage_id)
    }

    /// Merged record for a run: every stored payload type plus the index
    /// entry under `_index`. `None` when the run is unknown.
    pub fn retrieve_by_run_id(&self, run_id: &str) -> Result<Option<Value>> {
        let index = self.read_index()?;
        let Some(entry) = index.runs.get(run_id) else {
            return Ok(None);
        };

        let mut merged = json!({});
        for result_type in [
            ResultType::Backtest,
            ResultType::Evaluation,
            ResultType::Optimization,
        ] {
            let path = self.payload_path(result_type, run_id);
            if path.exists() {
                let raw = fs::read_to_string(&path).map_err(|source| RegistryError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                merged[result_type.tag()] = serde_json::from_str(&raw)?;
            }
        }

        if merged.as_object().is_some_and(|m| m.is_empty()) {
            return Ok(None);
        }

        merged["_index"] = serde_json::to_value(entry)?;
        Ok(Some(merged))
    }

    pub fn retrieve_by_strategy(
        &self,
        strategy_name: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Value>> {
        let index = self.read_index()?;
        let run_ids = index
            .strategies
            .get(strategy_name)
            .cloned()
            .unwrap_or_default();
        self.retrieve_page(&run_ids, limit, offset)
    }

    pub fn retrieve_by_symbol(&self, symbol: &str, limit: usize, offset: usize) -> Result<Vec<Value>> {
        let index = self.read_index()?;
        let run_ids = index.symbols.get(symbol).cloned().unwrap_or_default();
        self.retrieve_page(&run_ids, limit, offset)
    }

    fn retrieve_page(&self, run_ids: &[String], limit: usize, offset: usize) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        for run_id in run_ids.iter().skip(offset).take(limit) {
            if let Some(record) = self.retrieve_by_run_id(run_id)? {
                results.push(record);
            }
        }
        Ok(results)
    }

    pub fn total_count(&self, strategy_name: Option<&str>, symbol: Option<&str>) -> Result<usize> {
        let index = self.read_index()?;

        if let Some(strategy_name) = strategy_name {
            return Ok(index
                .strategies
                .get(strategy_name)
                .map(Vec::len)
                .unwrap_or(0));
        }
        if let Some(symbol) = symbol {
            return Ok(index.symbols.get(symbol).map(Vec::len).unwrap_or(0));
        }
        Ok(index.runs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn repository() -> (TempDir, ResultsRepository) {
        let dir = TempDir::new().unwrap();
        let repository = ResultsRepository::new(dir.path()).unwrap();
        (dir, repository)
    }

    #[test]
    fn store_then_retrieve_round_trips() {
        let (_dir, repository) = repository();

        repository
            .store(
                ResultType::Backtest,
                "run-1",
                "carga_descarga",
                "BTCUSDT",
                json!({"total_return": "100.5"}),
            )
            .unwrap();

        let record = repository.retrieve_by_run_id("run-1").unwrap().unwrap();
        assert_eq!(record["backtest"]["total_return"], "100.5");
        assert_eq!(
            record["backtest"]["_metadata"]["result_type"],
            "backtest"
        );
        assert_eq!(record["_index"]["strategy_name"], "carga_descarga");

        assert!(repository.retrieve_by_run_id("missing").unwrap().is_none());
    }

    #[test]
    fn overwrite_does_not_duplicate_index_entries() {
        let (_dir, repository) = repository();

        for value in [1, 2] {
            repository
                .store(
                    ResultType::Backtest,
                    "run-1",
                    "carga_descarga",
                    "BTCUSDT",
                    json!({"value": value}),
                )
                .unwrap();
        }

        let record = repository.retrieve_by_run_id("run-1").unwrap().unwrap();
        assert_eq!(record["backtest"]["value"], 2);

        assert_eq!(repository.total_count(Some("carga_descarga"), None).unwrap(), 1);
        assert_eq!(repository.total_count(None, Some("BTCUSDT")).unwrap(), 1);
        assert_eq!(repository.total_count(None, None).unwrap(), 1);
    }

    #[test]
    fn merged_record_collects_all_result_types() {
        let (_dir, repository) = repository();

        repository
            .store(
                ResultType::Backtest,
                "run-1",
                "s",
                "BTCUSDT",
                json!({"kind": "bt"}),
            )
            .unwrap();
        repository
            .store(
                ResultType::Evaluation,
                "run-1",
                "s",
                "BTCUSDT",
                json!({"kind": "ev"}),
            )
            .unwrap();
        repository
            .store(
                ResultType::Optimization,
                "run-1",
                "s",
                "BTCUSDT",
                json!({"kind": "opt"}),
            )
            .unwrap();

        let record = repository.retrieve_by_run_id("run-1").unwrap().unwrap();
        assert_eq!(record["backtest"]["kind"], "bt");
        assert_eq!(record["evaluation"]["kind"], "ev");
        assert_eq!(record["optimization"]["kind"], "opt");

        let types = record["_index"]["result_types"].as_array().unwrap();
        assert_eq!(types.len(), 3);
    }

    #[test]
    fn pagination_by_strategy_and_symbol() {
        let (_dir, repository) = repository();

        for i in 0..5 {
            repository
                .store(
                    ResultType::Backtest,
                    &format!("run-{i}"),
                    "s",
                    "BTCUSDT",
                    json!({"i": i}),
                )
                .unwrap();
        }

        let page = repository.retrieve_by_strategy("s", 2, 1).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0]["backtest"]["i"], 1);
        assert_eq!(page[1]["backtest"]["i"], 2);

        let page = repository.retrieve_by_symbol("BTCUSDT", 10, 4).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["backtest"]["i"], 4);

        assert!(repository.retrieve_by_strategy("unknown", 10, 0).unwrap().is_empty());
    }
}
