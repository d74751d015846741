//! Time-driven project status transitions.
//!
//! # Responsibility
//! - Promote scheduled projects whose start date has arrived to `active`
//!   inside the incoming batch, before it reaches the store.
//! - Report which transitions still need a remote write.
//!
//! # Invariants
//! - [`derive_status`] is a pure function of `(status, start_date, today)`
//!   and is idempotent.
//! - A remote transition write is requested at most once per project until
//!   a snapshot shows that project active (or the write is released).

use crate::model::entity::ProjectStatus;
use crate::model::record::Record;
use chrono::{DateTime, NaiveDate};
use log::debug;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

/// Status the project should have on `today`.
pub fn derive_status(
    status: ProjectStatus,
    start_date: Option<NaiveDate>,
    today: NaiveDate,
) -> ProjectStatus {
    match (status, start_date) {
        (ProjectStatus::Scheduled, Some(start)) if start <= today => ProjectStatus::Active,
        _ => status,
    }
}

/// Reads a start date stored as `YYYY-MM-DD`, RFC 3339 text or epoch millis.
pub fn parse_start_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::String(raw) => {
            let raw = raw.trim();
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .or_else(|| {
                    DateTime::parse_from_rfc3339(raw)
                        .ok()
                        .map(|parsed| parsed.date_naive())
                })
                .or_else(|| {
                    raw.get(..10)
                        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
                })
        }
        Value::Number(millis) => millis
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|parsed| parsed.date_naive()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub id: String,
    pub from: ProjectStatus,
    pub to: ProjectStatus,
}

/// Batch after evaluation.
#[derive(Debug, Clone)]
pub struct EvaluatedBatch {
    /// Input records with transitioned ones substituted in place.
    pub records: Vec<Record>,
    /// Transitions applied to this batch.
    pub substituted: usize,
    /// Transitions whose remote write should be issued now.
    pub writes: Vec<StatusTransition>,
}

#[derive(Debug, Default)]
pub struct DerivedStateEvaluator {
    in_flight: Mutex<HashSet<String>>,
}

impl DerivedStateEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates one full Projects batch. In-flight ids absent from a
    /// non-empty batch are forgotten, since the project no longer exists.
    pub fn evaluate(&self, records: Vec<Record>, today: NaiveDate) -> EvaluatedBatch {
        let mut in_flight = self.lock();
        let mut substituted = 0;
        let mut writes = Vec::new();

        let records = records
            .into_iter()
            .map(|mut record| {
                let Some(status) = record.text("status").and_then(ProjectStatus::parse) else {
                    return record;
                };
                if status == ProjectStatus::Active {
                    in_flight.remove(&record.id);
                    return record;
                }
                let start_date = record.payload.get("startDate").and_then(parse_start_date);
                let derived = derive_status(status, start_date, today);
                if derived == status {
                    return record;
                }

                record.payload.insert(
                    "status".to_string(),
                    Value::String(derived.as_str().to_string()),
                );
                substituted += 1;
                if in_flight.insert(record.id.clone()) {
                    writes.push(StatusTransition {
                        id: record.id.clone(),
                        from: status,
                        to: derived,
                    });
                }
                record
            })
            .collect::<Vec<Record>>();

        if !records.is_empty() {
            let present: HashSet<&str> = records.iter().map(|record| record.id.as_str()).collect();
            in_flight.retain(|id| present.contains(id.as_str()));
        }

        if substituted > 0 {
            debug!(
                "event=derive_status module=derived status=ok substituted={substituted} writes={} in_flight={}",
                writes.len(),
                in_flight.len()
            );
        }
        EvaluatedBatch {
            records,
            substituted,
            writes,
        }
    }

    /// Forgets an in-flight transition so the next batch may retry it.
    pub fn release(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
