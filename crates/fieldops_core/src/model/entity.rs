//! Typed business entities accepted by the mutation coordinator.
//!
//! # Responsibility
//! - Describe the fields the engine itself reads (status, dates, client
//!   contact) and keep every other field through a flattened map.
//! - Bind each entity type to its remote collection.
//!
//! # Invariants
//! - Serialized field names follow the remote camelCase schema.
//! - Unknown fields survive a decode/encode cycle unchanged.

use crate::model::collection::Collection;
use crate::model::validation::{ValidationError, Violations};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Contract shared by every entity the coordinator can create/update/delete.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Remote collection the entity is written to.
    const COLLECTION: Collection;
    /// Short name used in logs and validation messages.
    const NAME: &'static str;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Project lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Scheduled and awaiting its start date.
    #[default]
    Scheduled,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Some(Self::Scheduled),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    /// Set by `create_project` once the client link is resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Project {
    pub fn new(name: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            status: ProjectStatus::Scheduled,
            start_date: None,
            end_date: None,
            client_id: None,
            client_name: client_name.into(),
            client_email: None,
            client_phone: None,
            address: None,
            budget: None,
            extra: Map::new(),
        }
    }
}

impl Entity for Project {
    const COLLECTION: Collection = Collection::Projects;
    const NAME: &'static str = "project";

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut violations = Violations::new(Self::NAME);
        violations.require_text("name", &self.name);
        violations.require_text("clientName", &self.client_name);
        violations.optional_email("clientEmail", self.client_email.as_deref());
        violations.non_negative("budget", self.budget);
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                violations.push("endDate", "must not be earlier than startDate");
            }
        }
        violations.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Client {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            email: None,
            phone: None,
            address: None,
            extra: Map::new(),
        }
    }
}

impl Entity for Client {
    const COLLECTION: Collection = Collection::Clients;
    const NAME: &'static str = "client";

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut violations = Violations::new(Self::NAME);
        violations.require_text("name", &self.name);
        violations.optional_email("email", self.email.as_deref());
        violations.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Employee {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_rate: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Employee {
    const COLLECTION: Collection = Collection::Employees;
    const NAME: &'static str = "employee";

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut violations = Violations::new(Self::NAME);
        violations.require_text("name", &self.name);
        violations.optional_email("email", self.email.as_deref());
        violations.non_negative("dailyRate", self.daily_rate);
        violations.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    #[serde(default)]
    pub id: String,
    pub project_id: String,
    pub description: String,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Expense {
    const COLLECTION: Collection = Collection::Expenses;
    const NAME: &'static str = "expense";

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut violations = Violations::new(Self::NAME);
        violations.require_text("projectId", &self.project_id);
        violations.require_text("description", &self.description);
        if !self.amount.is_finite() || self.amount <= 0.0 {
            violations.push("amount", "must be greater than zero");
        }
        violations.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    #[serde(default)]
    pub id: String,
    pub employee_id: String,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub hours: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for AttendanceRecord {
    const COLLECTION: Collection = Collection::Attendance;
    const NAME: &'static str = "attendance";

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut violations = Violations::new(Self::NAME);
        violations.require_text("employeeId", &self.employee_id);
        if !self.hours.is_finite() || !(0.0..=24.0).contains(&self.hours) {
            violations.push("hours", "must be between 0 and 24");
        }
        violations.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prospect {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_value: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Prospect {
    const COLLECTION: Collection = Collection::Prospects;
    const NAME: &'static str = "prospect";

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut violations = Violations::new(Self::NAME);
        violations.require_text("name", &self.name);
        violations.optional_email("email", self.email.as_deref());
        violations.non_negative("estimatedValue", self.estimated_value);
        violations.finish()
    }
}
