//! Durable deployment state using redb.
//!
//! # Table design
//!
//! ```text
//! runs    u64 run_seq                            → JSON RunRecord
//! status  [ component bytes | 0x00 | run_seq BE ] → JSON StatusRecord
//! phase   &str component                         → JSON PhaseRecord
//! ```
//!
//! Component names never contain `0x00`, so every component owns a
//! contiguous key range in `status` and, because the sequence number is
//! big-endian, that range is ordered oldest run first. There is one status
//! record per component per run; later runs append, and the record with the
//! highest sequence number is authoritative.
//!
//! Writes for a component happen inside a single redb write transaction that
//! first reads the component's latest record, so concurrent writers are
//! serialized and a write from an older run than the latest recorded one is
//! rejected instead of silently winning.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StackupError};
use crate::paths;
use crate::types::{BootstrapPhase, DeploymentStatus, Environment};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const RUNS: TableDefinition<u64, &[u8]> = TableDefinition::new("runs");
const STATUS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("status");
const PHASE: TableDefinition<&str, &[u8]> = TableDefinition::new("phase");

fn status_key(component: &str, run_seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(component.len() + 9);
    key.extend_from_slice(component.as_bytes());
    key.push(0);
    key.extend_from_slice(&run_seq.to_be_bytes());
    key
}

/// Inclusive bounds covering every run of `component`.
fn component_bounds(component: &str) -> (Vec<u8>, Vec<u8>) {
    (status_key(component, 0), status_key(component, u64::MAX))
}

fn db_err<E: std::fmt::Display>(e: E) -> StackupError {
    StackupError::StateDb(e.to_string())
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub component: String,
    pub run_id: Uuid,
    pub run_seq: u64,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub run_seq: u64,
    pub environment: Environment,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub component: String,
    pub phase: BootstrapPhase,
    pub run_seq: u64,
    pub changed_at: DateTime<Utc>,
}

/// One past run with the statuses recorded during it.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub run: RunRecord,
    pub components: Vec<StatusRecord>,
}

// ---------------------------------------------------------------------------
// StateTracker
// ---------------------------------------------------------------------------

pub struct StateTracker {
    db: Database,
}

impl StateTracker {
    /// Open or create the state database at `path`, creating all tables.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(RUNS).map_err(db_err)?;
        wt.open_table(STATUS).map_err(db_err)?;
        wt.open_table(PHASE).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    pub fn open_in(root: &Path) -> Result<Self> {
        Self::open(&paths::state_db_path(root))
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Allocate the next run sequence number and persist the run header.
    ///
    /// Components left `Running` by an interrupted earlier run are marked
    /// `Failed` first so they are retried rather than trusted.
    pub fn begin_run(&self, environment: Environment) -> Result<RunRecord> {
        let recovered = self.recover_interrupted()?;
        if recovered > 0 {
            warn!(recovered, "marked components from an interrupted run as failed");
        }

        let wt = self.db.begin_write().map_err(db_err)?;
        let run = {
            let mut runs = wt.open_table(RUNS).map_err(db_err)?;
            let last = runs
                .last()
                .map_err(db_err)?
                .map(|(k, _)| k.value())
                .unwrap_or(0);
            let run = RunRecord {
                run_id: Uuid::new_v4(),
                run_seq: last + 1,
                environment,
                started_at: Utc::now(),
                finished_at: None,
                exit_code: None,
            };
            let value = serde_json::to_vec(&run)?;
            runs.insert(run.run_seq, value.as_slice()).map_err(db_err)?;
            run
        };
        wt.commit().map_err(db_err)?;
        debug!(run_seq = run.run_seq, run_id = %run.run_id, "run started");
        Ok(run)
    }

    pub fn finish_run(&self, run_seq: u64, exit_code: i32) -> Result<()> {
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut runs = wt.open_table(RUNS).map_err(db_err)?;
            let mut run: RunRecord = {
                let existing = runs
                    .get(run_seq)
                    .map_err(db_err)?
                    .ok_or_else(|| StackupError::StateDb(format!("run {run_seq} not found")))?;
                serde_json::from_slice(existing.value())?
            };
            run.finished_at = Some(Utc::now());
            run.exit_code = Some(exit_code);
            let value = serde_json::to_vec(&run)?;
            runs.insert(run_seq, value.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn runs(&self) -> Result<Vec<RunRecord>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let runs = rt.open_table(RUNS).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in runs.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Status records
    // -----------------------------------------------------------------------

    /// Record `status` for `component` in `run`.
    ///
    /// Rejects writes from a run older than the component's latest record,
    /// and within a run only accepts transitions allowed by
    /// [`DeploymentStatus::can_transition_to`]. The first record of a run
    /// must be `Pending`.
    pub fn record(
        &self,
        run: &RunRecord,
        component: &str,
        status: DeploymentStatus,
        message: Option<&str>,
    ) -> Result<StatusRecord> {
        paths::validate_name(component)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        let record = {
            let mut table = wt.open_table(STATUS).map_err(db_err)?;
            let latest = latest_in(&table, component)?;

            match &latest {
                Some(prev) if prev.run_seq > run.run_seq => {
                    return Err(StackupError::OutOfOrderWrite {
                        component: component.to_string(),
                        attempted: run.run_seq,
                        latest: prev.run_seq,
                    });
                }
                Some(prev) if prev.run_seq == run.run_seq => {
                    if !prev.status.can_transition_to(status) {
                        return Err(StackupError::InvalidTransition {
                            component: component.to_string(),
                            from: prev.status.to_string(),
                            to: status.to_string(),
                        });
                    }
                }
                _ if status != DeploymentStatus::Pending => {
                    return Err(StackupError::InvalidTransition {
                        component: component.to_string(),
                        from: "none".into(),
                        to: status.to_string(),
                    });
                }
                _ => {}
            }

            let record = StatusRecord {
                component: component.to_string(),
                run_id: run.run_id,
                run_seq: run.run_seq,
                status,
                message: message.map(str::to_string),
                recorded_at: Utc::now(),
            };
            let key = status_key(component, run.run_seq);
            let value = serde_json::to_vec(&record)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
            record
        };
        wt.commit().map_err(db_err)?;
        debug!(component, run_seq = run.run_seq, status = %status, "status recorded");
        Ok(record)
    }

    /// The explicit retry edge: `Failed → Pending` within the same run.
    pub fn retry(&self, run: &RunRecord, component: &str, message: &str) -> Result<StatusRecord> {
        self.record(run, component, DeploymentStatus::Pending, Some(message))
    }

    /// The most recent record for `component`, from any run.
    pub fn get(&self, component: &str) -> Result<Option<StatusRecord>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(STATUS).map_err(db_err)?;
        latest_in(&table, component)
    }

    /// The most recent `Succeeded` or `Failed` record, ignoring runs where
    /// the component was skipped or never finished. This is what decides
    /// "already deployed, skip" on a re-run.
    pub fn last_settled(&self, component: &str) -> Result<Option<StatusRecord>> {
        Ok(self.component_history(component)?.into_iter().rev().find(|r| {
            matches!(
                r.status,
                DeploymentStatus::Succeeded | DeploymentStatus::Failed
            )
        }))
    }

    /// Every record for `component`, oldest run first.
    pub fn component_history(&self, component: &str) -> Result<Vec<StatusRecord>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(STATUS).map_err(db_err)?;
        let (lo, hi) = component_bounds(component);
        let mut out = Vec::new();
        for entry in table.range(lo.as_slice()..=hi.as_slice()).map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    /// Latest record for every component that has one, sorted by name.
    pub fn latest_all(&self) -> Result<Vec<StatusRecord>> {
        let mut latest: Vec<StatusRecord> = Vec::new();
        for record in self.all_records()? {
            match latest.last_mut() {
                Some(last) if last.component == record.component => *last = record,
                _ => latest.push(record),
            }
        }
        Ok(latest)
    }

    /// Past runs in sequence order, each with the statuses recorded in it.
    pub fn history(&self) -> Result<Vec<RunSummary>> {
        let records = self.all_records()?;
        Ok(self
            .runs()?
            .into_iter()
            .map(|run| {
                let components = records
                    .iter()
                    .filter(|r| r.run_seq == run.run_seq)
                    .cloned()
                    .collect();
                RunSummary { run, components }
            })
            .collect())
    }

    fn all_records(&self) -> Result<Vec<StatusRecord>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(STATUS).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    /// Mark every component whose latest record is still `Running` as
    /// `Failed`. Returns how many were recovered.
    pub fn recover_interrupted(&self) -> Result<u32> {
        let stuck: Vec<StatusRecord> = self
            .latest_all()?
            .into_iter()
            .filter(|r| r.status == DeploymentStatus::Running)
            .collect();
        let mut count = 0;
        for rec in stuck {
            let run = RunRecord {
                run_id: rec.run_id,
                run_seq: rec.run_seq,
                environment: Environment::default(),
                started_at: rec.recorded_at,
                finished_at: None,
                exit_code: None,
            };
            self.record(
                &run,
                &rec.component,
                DeploymentStatus::Failed,
                Some("interrupted: process exited while deploying"),
            )?;
            count += 1;
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Bootstrap phase
    // -----------------------------------------------------------------------

    pub fn phase(&self, component: &str) -> Result<BootstrapPhase> {
        Ok(self
            .phase_record(component)?
            .map(|r| r.phase)
            .unwrap_or_default())
    }

    pub fn phase_record(&self, component: &str) -> Result<Option<PhaseRecord>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(PHASE).map_err(db_err)?;
        let value = table.get(component).map_err(db_err)?;
        match value {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn set_phase(&self, component: &str, phase: BootstrapPhase, run_seq: u64) -> Result<()> {
        paths::validate_name(component)?;
        let record = PhaseRecord {
            component: component.to_string(),
            phase,
            run_seq,
            changed_at: Utc::now(),
        };
        let value = serde_json::to_vec(&record)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(PHASE).map_err(db_err)?;
            table.insert(component, value.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }
}

fn latest_in<T>(table: &T, component: &str) -> Result<Option<StatusRecord>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let (lo, hi) = component_bounds(component);
    let mut range = table.range(lo.as_slice()..=hi.as_slice()).map_err(db_err)?;
    match range.next_back() {
        Some(entry) => {
            let (_, v) = entry.map_err(db_err)?;
            Ok(Some(serde_json::from_slice(v.value())?))
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
