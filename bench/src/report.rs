use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use engine::core::types::TaskOutcome;
use engine::io::recorder::{TaskRecord, scan_records};
use serde::Serialize;

const UNKNOWN_KIND: &str = "unknown";

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct KindStats {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub avg_duration_ms: Option<f64>,
    #[serde(skip)]
    timed: usize,
}

impl KindStats {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.errored
    }

    fn add_duration(&mut self, duration_ms: u64) {
        self.timed += 1;
        self.avg_duration_ms = Some(match self.avg_duration_ms {
            None => duration_ms as f64,
            Some(avg) => {
                let total = avg * (self.timed as f64 - 1.0) + duration_ms as f64;
                total / self.timed as f64
            }
        });
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub overall: KindStats,
    pub kinds: BTreeMap<String, KindStats>,
}

/// Aggregate every task directory under `logs`. Inconsistent or malformed
/// entries are reported as warnings rather than errors.
pub fn aggregate(logs: &Path) -> Result<(ReportSummary, Vec<String>)> {
    let (records, mut warnings) = scan_records(logs)?;
    let mut summary = ReportSummary::default();

    for record in &records {
        let kind = match &record.meta {
            Some(meta) => meta.kind.clone(),
            None => {
                warnings.push(format!("{}: no meta.json", record.identity));
                UNKNOWN_KIND.to_string()
            }
        };
        let outcome = classify(record, &mut warnings);
        let duration = record.meta.as_ref().map(|meta| meta.duration_ms);

        for stats in [&mut summary.overall, summary.kinds.entry(kind).or_default()] {
            match outcome {
                TaskOutcome::Passed => stats.passed += 1,
                TaskOutcome::Failed => stats.failed += 1,
                TaskOutcome::Errored => stats.errored += 1,
            }
            if let Some(duration) = duration {
                stats.add_duration(duration);
            }
        }
    }

    Ok((summary, warnings))
}

/// The result marker is authoritative; metadata only fills in when it is missing.
fn classify(record: &TaskRecord, warnings: &mut Vec<String>) -> TaskOutcome {
    let marker = record.passed.map(|passed| {
        if passed {
            TaskOutcome::Passed
        } else {
            TaskOutcome::Failed
        }
    });
    let recorded = record.meta.as_ref().map(|meta| meta.outcome);
    match (marker, recorded) {
        (Some(marker), Some(recorded)) if marker != recorded => {
            warnings.push(format!(
                "{}: result marker says {marker:?} but meta.json says {recorded:?}",
                record.identity
            ));
            marker
        }
        (Some(marker), _) => marker,
        (None, Some(TaskOutcome::Errored)) => TaskOutcome::Errored,
        (None, Some(recorded)) => {
            warnings.push(format!(
                "{}: meta.json says {recorded:?} but no result marker exists",
                record.identity
            ));
            TaskOutcome::Errored
        }
        (None, None) => TaskOutcome::Errored,
    }
}
