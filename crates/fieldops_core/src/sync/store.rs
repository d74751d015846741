//! Consumer-owned in-memory store.
//!
//! # Responsibility
//! - Hold the ordered record list of every state slot.
//! - Apply events from the two producers (mutation coordinator and
//!   subscription manager) one at a time, stamping each with a sequence.
//! - Re-persist the whole slot through the scheduler after every change.
//!
//! # Invariants
//! - Events are applied in arrival order; the later event wins.
//! - Record ids are unique within a slot.
//! - Hydration never triggers a persistence write.
//! - A slot fed by several sources keeps one list per source. Local upserts
//!   and removes edit those lists too, so a snapshot from one source never
//!   drops records another source (or a local mutation) contributed.

use crate::model::collection::{Collection, StateSlot};
use crate::model::record::Record;
use crate::sync::scheduler::PersistenceScheduler;
use log::{debug, info};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// One state change offered to the store.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// Records restored from the local snapshot at startup.
    Hydrate {
        slot: StateSlot,
        records: Vec<Record>,
    },
    /// Optimistic create or update; replaces by id or appends.
    Upsert(Record),
    /// Optimistic delete.
    Remove { slot: StateSlot, id: String },
    /// Authoritative full contents of a slot.
    Snapshot {
        slot: StateSlot,
        records: Vec<Record>,
        /// Whether an empty list may replace non-empty state.
        accept_empty: bool,
    },
    /// Authoritative full contents of one source collection. Equivalent to
    /// `Snapshot` unless the slot is fed by several sources.
    SourceSnapshot {
        source: Collection,
        records: Vec<Record>,
        accept_empty: bool,
    },
}

impl StoreEvent {
    pub fn slot(&self) -> StateSlot {
        match self {
            Self::Hydrate { slot, .. } | Self::Remove { slot, .. } | Self::Snapshot { slot, .. } => {
                *slot
            }
            Self::Upsert(record) => record.collection.slot(),
            Self::SourceSnapshot { source, .. } => source.slot(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Hydrate { .. } => "hydrate",
            Self::Upsert(_) => "upsert",
            Self::Remove { .. } => "remove",
            Self::Snapshot { .. } => "snapshot",
            Self::SourceSnapshot { .. } => "source_snapshot",
        }
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { sequence: u64 },
    /// Nothing to change (e.g. removing an unknown id).
    Unchanged,
    /// Empty snapshot discarded to keep prior non-empty state.
    DiscardedEmpty,
}

/// Latest list of one source of a split slot.
struct SourceList {
    /// Emission order; hydrated and locally created lists start at 0.
    emission: u64,
    records: Vec<Record>,
}

#[derive(Default)]
struct StoreState {
    slots: BTreeMap<StateSlot, Vec<Record>>,
    sources: HashMap<Collection, SourceList>,
    next_emission: u64,
    sequence: u64,
}

impl StoreState {
    /// Rebuilds the per-source lists of a split slot from a full record list.
    fn reset_sources(&mut self, slot: StateSlot, records: &[Record]) {
        if !slot.is_split() {
            return;
        }
        for source in slot.sources() {
            self.sources.remove(source);
        }
        for record in records {
            upsert_record(
                &mut self
                    .sources
                    .entry(record.collection)
                    .or_insert_with(|| SourceList {
                        emission: 0,
                        records: Vec::new(),
                    })
                    .records,
                record.clone(),
            );
        }
    }

    /// Whole-slot replacement behind the empty-snapshot guard.
    fn replace_slot(
        &mut self,
        slot: StateSlot,
        records: Vec<Record>,
        accept_empty: bool,
    ) -> Option<bool> {
        let current_len = self.slots.get(&slot).map_or(0, Vec::len);
        if records.is_empty() && current_len > 0 && !accept_empty {
            return None;
        }
        let records = dedupe_by_id(records);
        self.reset_sources(slot, &records);
        self.slots.insert(slot, records);
        Some(true)
    }

    /// Mirrors a local upsert into the list of its source collection.
    fn upsert_source(&mut self, slot: StateSlot, record: &Record) {
        if !slot.is_split() {
            return;
        }
        for source in slot.sources() {
            if *source != record.collection {
                if let Some(list) = self.sources.get_mut(source) {
                    list.records.retain(|existing| existing.id != record.id);
                }
            }
        }
        let list = self
            .sources
            .entry(record.collection)
            .or_insert_with(|| SourceList {
                emission: 0,
                records: Vec::new(),
            });
        upsert_record(&mut list.records, record.clone());
    }

    fn remove_source(&mut self, slot: StateSlot, id: &str) {
        for source in slot.sources() {
            if let Some(list) = self.sources.get_mut(source) {
                list.records.retain(|existing| existing.id != id);
            }
        }
    }

    /// Replaces the list of `source` and recomputes the union of its slot.
    /// `None` when an empty list was guarded.
    fn merge_source(
        &mut self,
        source: Collection,
        records: Vec<Record>,
        accept_empty: bool,
    ) -> Option<Vec<Record>> {
        let slot = source.slot();
        let attributed = self
            .sources
            .get(&source)
            .map_or(0, |list| list.records.len());
        if records.is_empty() && attributed > 0 && !accept_empty {
            return None;
        }

        self.next_emission += 1;
        self.sources.insert(
            source,
            SourceList {
                emission: self.next_emission,
                records: dedupe_by_id(records),
            },
        );

        let mut lists: Vec<&SourceList> = slot
            .sources()
            .iter()
            .filter_map(|source| self.sources.get(source))
            .collect();
        lists.sort_by_key(|list| list.emission);
        Some(dedupe_by_id(
            lists
                .into_iter()
                .flat_map(|list| list.records.iter().cloned())
                .collect(),
        ))
    }
}

pub struct SyncStore {
    state: Mutex<StoreState>,
    scheduler: PersistenceScheduler,
    key_prefix: String,
    revision: watch::Sender<u64>,
}

impl SyncStore {
    pub fn new(scheduler: PersistenceScheduler, key_prefix: impl Into<String>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Mutex::new(StoreState::default()),
            scheduler,
            key_prefix: key_prefix.into(),
            revision,
        }
    }

    pub fn scheduler(&self) -> &PersistenceScheduler {
        &self.scheduler
    }

    pub fn storage_key(&self, slot: StateSlot) -> String {
        slot.storage_key(&self.key_prefix)
    }

    /// Change notifications: the value is the sequence of the last applied event.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    pub fn records(&self, slot: StateSlot) -> Vec<Record> {
        self.lock().slots.get(&slot).cloned().unwrap_or_default()
    }

    pub fn get(&self, slot: StateSlot, id: &str) -> Option<Record> {
        self.lock()
            .slots
            .get(&slot)
            .and_then(|records| records.iter().find(|record| record.id == id).cloned())
    }

    pub fn len(&self, slot: StateSlot) -> usize {
        self.lock().slots.get(&slot).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, slot: StateSlot) -> bool {
        self.len(slot) == 0
    }

    /// Applies one event and schedules persistence of the affected slot.
    pub fn apply(&self, event: StoreEvent) -> ApplyOutcome {
        let slot = event.slot();
        let label = event.label();
        let persist = !matches!(event, StoreEvent::Hydrate { .. });

        let (outcome, payloads) = {
            let mut state = self.lock();
            let changed = match event {
                StoreEvent::Hydrate { records, .. } => {
                    let records = dedupe_by_id(records);
                    state.reset_sources(slot, &records);
                    state.slots.insert(slot, records);
                    Some(true)
                }
                StoreEvent::Upsert(record) => {
                    state.upsert_source(slot, &record);
                    upsert_record(state.slots.entry(slot).or_default(), record);
                    Some(true)
                }
                StoreEvent::Remove { id, .. } => {
                    state.remove_source(slot, &id);
                    let records = state.slots.entry(slot).or_default();
                    let before = records.len();
                    records.retain(|record| record.id != id);
                    Some(records.len() != before)
                }
                StoreEvent::Snapshot {
                    records,
                    accept_empty,
                    ..
                } => state.replace_slot(slot, records, accept_empty),
                StoreEvent::SourceSnapshot {
                    source,
                    records,
                    accept_empty,
                } => {
                    if slot.is_split() {
                        state.merge_source(source, records, accept_empty).map(|merged| {
                            state.slots.insert(slot, merged);
                            true
                        })
                    } else {
                        state.replace_slot(slot, records, accept_empty)
                    }
                }
            };

            match changed {
                None => (ApplyOutcome::DiscardedEmpty, None),
                Some(false) => (ApplyOutcome::Unchanged, None),
                Some(true) => {
                    state.sequence += 1;
                    let payloads = state
                        .slots
                        .get(&slot)
                        .map(|records| records.iter().map(Record::to_value).collect::<Vec<_>>())
                        .unwrap_or_default();
                    (
                        ApplyOutcome::Applied {
                            sequence: state.sequence,
                        },
                        Some(payloads),
                    )
                }
            }
        };

        match outcome {
            ApplyOutcome::Applied { sequence } => {
                debug!(
                    "event=store_apply module=store status=ok kind={label} slot={slot} sequence={sequence}"
                );
                if let (true, Some(payloads)) = (persist, payloads) {
                    self.scheduler
                        .schedule(&self.storage_key(slot), Value::Array(payloads));
                }
                self.revision.send_replace(sequence);
            }
            ApplyOutcome::DiscardedEmpty => info!(
                "event=store_apply module=store status=skipped kind={label} slot={slot} reason=empty_snapshot_guard"
            ),
            ApplyOutcome::Unchanged => debug!(
                "event=store_apply module=store status=skipped kind={label} slot={slot} reason=unchanged"
            ),
        }
        outcome
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn upsert_record(records: &mut Vec<Record>, record: Record) {
    match records.iter_mut().find(|existing| existing.id == record.id) {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}

/// Keeps the last occurrence of every id at the position of its first occurrence.
fn dedupe_by_id(records: Vec<Record>) -> Vec<Record> {
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    let mut out: Vec<Record> = Vec::with_capacity(records.len());
    for record in records {
        match index.get(&record.id) {
            Some(position) => out[*position] = record,
            None => {
                index.insert(record.id.clone(), out.len());
                out.push(record);
            }
        }
    }
    out
}
