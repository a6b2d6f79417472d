//! `RunStore`: durable, file-based per-run state (Section 4.A).
//!
//! Grounded in the reference `FilesystemStore`: one directory per run under
//! `runs_dir`, containing `state.json`, an append-only `iterations.jsonl`,
//! a plain-text `events.log`, and an `artifacts/` tree. Unlike the
//! reference, `write_state` here goes through a temp-file-plus-rename so a
//! crash mid-write never leaves `state.json` truncated (Section 4.A's
//! atomicity contract, grounded in the reference implementation's checkpoint
//! write-tmp/fsync/rename pattern).

use loop_core::error::StoreError;
use loop_core::{Id, IterationRecord, RunState, StoreResult};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let runs_dir = runs_dir.into();
        std::fs::create_dir_all(&runs_dir)?;
        Ok(Self { runs_dir })
    }

    pub fn run_dir(&self, run_id: &Id) -> PathBuf {
        self.runs_dir.join(run_id.as_ref())
    }

    fn state_path(&self, run_id: &Id) -> PathBuf {
        self.run_dir(run_id).join("state.json")
    }

    fn iterations_path(&self, run_id: &Id) -> PathBuf {
        self.run_dir(run_id).join("iterations.jsonl")
    }

    fn events_path(&self, run_id: &Id) -> PathBuf {
        self.run_dir(run_id).join("events.log")
    }

    /// List every run id that has a `state.json` under `runs_dir`.
    pub fn list_run_ids(&self) -> StoreResult<Vec<Id>> {
        if !self.runs_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.runs_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && path.join("state.json").is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    ids.push(Id::from_string(name));
                }
            }
        }
        ids.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));
        Ok(ids)
    }

    /// Create a run's directory layout and write its initial state.
    pub fn init_run(&self, state: &RunState) -> StoreResult<()> {
        std::fs::create_dir_all(self.run_dir(&state.run_id).join("artifacts"))?;
        self.write_state(state)?;
        self.log_event(&state.run_id, "run initialized")?;
        Ok(())
    }

    /// Atomically overwrite `state.json` via write-to-temp-then-rename.
    pub fn write_state(&self, state: &RunState) -> StoreResult<()> {
        let dir = self.run_dir(&state.run_id);
        std::fs::create_dir_all(&dir)?;
        let final_path = self.state_path(&state.run_id);
        let tmp_path = final_path.with_extension("json.tmp");

        let json = serde_json::to_vec_pretty(state)?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    pub fn read_state(&self, run_id: &Id) -> StoreResult<RunState> {
        let path = self.state_path(run_id);
        let content = std::fs::read_to_string(&path)
            .map_err(|_| StoreError::NotFound(run_id.to_string()))?;
        serde_json::from_str(&content)
            .map_err(|err| StoreError::Corrupt(path.display().to_string(), err.to_string()))
    }

    /// Append one iteration record as a JSONL line.
    pub fn append_iteration(&self, record: &IterationRecord) -> StoreResult<()> {
        let path = self.iterations_path(&record.run_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn read_iterations(&self, run_id: &Id) -> StoreResult<Vec<IterationRecord>> {
        let path = self.iterations_path(run_id);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let mut rows = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(line)
                .map_err(|err| StoreError::Corrupt(path.display().to_string(), err.to_string()))?;
            rows.push(record);
        }
        Ok(rows)
    }

    /// Append a plain `"<rfc3339> <message>\n"` line to the events log.
    pub fn log_event(&self, run_id: &Id, message: &str) -> StoreResult<()> {
        let path = self.events_path(run_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", loop_core::events::format_event(message))?;
        Ok(())
    }

    pub fn read_events(&self, run_id: &Id) -> StoreResult<Vec<String>> {
        let path = self.events_path(run_id);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(content.lines().filter(|l| !l.trim().is_empty()).map(str::to_string).collect())
    }

    /// Read only events appended after `after_index` (0-based), for SSE
    /// resumption via `Last-Event-ID` (Section 6.1).
    pub fn read_events_after(&self, run_id: &Id, after_index: usize) -> StoreResult<Vec<String>> {
        let all = self.read_events(run_id)?;
        Ok(all.into_iter().skip(after_index).collect())
    }

    /// Read-modify-write `cancel_requested = true` on a run's state.
    pub fn request_cancel(&self, run_id: &Id) -> StoreResult<()> {
        let mut state = self.read_state(run_id)?;
        state.cancel_requested = true;
        self.write_state(&state)?;
        self.log_event(run_id, "cancel requested")?;
        Ok(())
    }

    /// Resolve `rel_path` against a run's workspace-confined paths
    /// (`artifacts/`), rejecting escapes.
    pub fn resolve_artifact_path(&self, run_id: &Id, rel_path: &str) -> StoreResult<PathBuf> {
        let root = self.run_dir(run_id).join("artifacts");
        let candidate = root.join(rel_path);
        if !Self::is_within(&root, &candidate) {
            return Err(StoreError::PathEscape {
                root: "artifacts",
                path: rel_path.to_string(),
            });
        }
        Ok(candidate)
    }

    fn is_within(root: &Path, candidate: &Path) -> bool {
        use std::path::Component;
        let mut depth: i64 = 0;
        for component in candidate.strip_prefix(root).unwrap_or(candidate).components() {
            match component {
                Component::ParentDir => depth -= 1,
                Component::Normal(_) => depth += 1,
                _ => {}
            }
            if depth < 0 {
                return false;
            }
        }
        true
    }
}
