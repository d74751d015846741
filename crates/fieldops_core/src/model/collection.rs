//! Remote collection catalog and in-memory state slots.
//!
//! # Responsibility
//! - Name every remote collection the engine consumes.
//! - Map each collection to its local backup key and in-memory slot.
//!
//! # Invariants
//! - Remote names and storage key suffixes are stable; persisted snapshots
//!   written by older builds must stay readable under the same key.
//! - `partners` shares the `clients` slot (split entity type).

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Remote collections consumed by the field-operations app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Projects,
    Clients,
    Partners,
    Employees,
    Expenses,
    Attendance,
    Prospects,
    Notifications,
    Users,
    TeamMessages,
    Company,
}

const ALL_COLLECTIONS: &[Collection] = &[
    Collection::Projects,
    Collection::Clients,
    Collection::Partners,
    Collection::Employees,
    Collection::Expenses,
    Collection::Attendance,
    Collection::Prospects,
    Collection::Notifications,
    Collection::Users,
    Collection::TeamMessages,
    Collection::Company,
];

impl Collection {
    /// Returns every known collection in declaration order.
    pub fn all() -> &'static [Collection] {
        ALL_COLLECTIONS
    }

    /// Name of the collection in the remote document store.
    pub fn remote_name(self) -> &'static str {
        match self {
            Self::Projects => "projects",
            Self::Clients => "clients",
            Self::Partners => "partners",
            Self::Employees => "employees",
            Self::Expenses => "expenses",
            Self::Attendance => "attendance",
            Self::Prospects => "prospects",
            Self::Notifications => "notifications",
            Self::Users => "users",
            Self::TeamMessages => "teamMessages",
            Self::Company => "company",
        }
    }

    /// Parses a remote collection name.
    pub fn from_remote_name(value: &str) -> Option<Self> {
        ALL_COLLECTIONS
            .iter()
            .copied()
            .find(|collection| collection.remote_name() == value.trim())
    }

    /// In-memory slot fed by this collection.
    pub fn slot(self) -> StateSlot {
        match self {
            Self::Projects => StateSlot::Projects,
            Self::Clients | Self::Partners => StateSlot::Clients,
            Self::Employees => StateSlot::Employees,
            Self::Expenses => StateSlot::Expenses,
            Self::Attendance => StateSlot::Attendance,
            Self::Prospects => StateSlot::Prospects,
            Self::Notifications => StateSlot::Notifications,
            Self::Users => StateSlot::Users,
            Self::TeamMessages => StateSlot::TeamMessages,
            Self::Company => StateSlot::Company,
        }
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.remote_name())
    }
}

/// Logical view held in memory and mirrored to one local backup entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateSlot {
    Projects,
    /// Union of `clients` and `partners`.
    Clients,
    Employees,
    Expenses,
    Attendance,
    Prospects,
    Notifications,
    Users,
    TeamMessages,
    Company,
}

const ALL_SLOTS: &[StateSlot] = &[
    StateSlot::Projects,
    StateSlot::Clients,
    StateSlot::Employees,
    StateSlot::Expenses,
    StateSlot::Attendance,
    StateSlot::Prospects,
    StateSlot::Notifications,
    StateSlot::Users,
    StateSlot::TeamMessages,
    StateSlot::Company,
];

impl StateSlot {
    pub fn all() -> &'static [StateSlot] {
        ALL_SLOTS
    }

    /// Stable name used in export bundles and storage keys.
    pub fn name(self) -> &'static str {
        match self {
            Self::Projects => "projects",
            Self::Clients => "clients",
            Self::Employees => "employees",
            Self::Expenses => "expenses",
            Self::Attendance => "attendance",
            Self::Prospects => "prospects",
            Self::Notifications => "notifications",
            Self::Users => "users",
            Self::TeamMessages => "teamMessages",
            Self::Company => "company",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        ALL_SLOTS
            .iter()
            .copied()
            .find(|slot| slot.name() == value.trim())
    }

    /// Source collections feeding this slot, in merge order.
    pub fn sources(self) -> &'static [Collection] {
        match self {
            Self::Projects => &[Collection::Projects],
            Self::Clients => &[Collection::Clients, Collection::Partners],
            Self::Employees => &[Collection::Employees],
            Self::Expenses => &[Collection::Expenses],
            Self::Attendance => &[Collection::Attendance],
            Self::Prospects => &[Collection::Prospects],
            Self::Notifications => &[Collection::Notifications],
            Self::Users => &[Collection::Users],
            Self::TeamMessages => &[Collection::TeamMessages],
            Self::Company => &[Collection::Company],
        }
    }

    /// Whether several source collections merge into this slot.
    pub fn is_split(self) -> bool {
        self.sources().len() > 1
    }

    /// Local backup key under the given prefix, e.g. `fieldops.projects.backup`.
    pub fn storage_key(self, prefix: &str) -> String {
        format!("{prefix}.{}.backup", self.name())
    }
}

impl Display for StateSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
