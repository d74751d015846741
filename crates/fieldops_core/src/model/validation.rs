//! Payload validation errors and shared field checks.
//!
//! # Responsibility
//! - Collect one violation per failed field before any mutation runs.
//!
//! # Invariants
//! - Validation is the only error class that blocks a mutation.
//! - Field names use the remote (camelCase) schema spelling.

use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex")
});

/// One rejected field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: &'static str,
    pub message: String,
}

/// Payload rejected before any mutation is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub entity: &'static str,
    pub violations: Vec<FieldViolation>,
}

impl ValidationError {
    pub fn single(entity: &'static str, field: &'static str, message: impl Into<String>) -> Self {
        Self {
            entity,
            violations: vec![FieldViolation {
                field,
                message: message.into(),
            }],
        }
    }

    /// Returns the violation for `field`, if any.
    pub fn field(&self, field: &str) -> Option<&FieldViolation> {
        self.violations.iter().find(|violation| violation.field == field)
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}:", self.entity)?;
        for violation in &self.violations {
            write!(f, " {}: {};", violation.field, violation.message)?;
        }
        Ok(())
    }
}

impl Error for ValidationError {}

/// Accumulates violations for one entity.
#[derive(Debug)]
pub struct Violations {
    entity: &'static str,
    items: Vec<FieldViolation>,
}

impl Violations {
    pub fn new(entity: &'static str) -> Self {
        Self {
            entity,
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.items.push(FieldViolation {
            field,
            message: message.into(),
        });
    }

    pub fn require_text(&mut self, field: &'static str, value: &str) {
        if value.trim().is_empty() {
            self.push(field, "is required");
        }
    }

    pub fn optional_email(&mut self, field: &'static str, value: Option<&str>) {
        if let Some(value) = value {
            let trimmed = value.trim();
            if !trimmed.is_empty() && !is_valid_email(trimmed) {
                self.push(field, format!("`{trimmed}` is not a valid email address"));
            }
        }
    }

    pub fn non_negative(&mut self, field: &'static str, value: Option<f64>) {
        if let Some(value) = value {
            if !value.is_finite() || value < 0.0 {
                self.push(field, "must be a non-negative number");
            }
        }
    }

    pub fn finish(self) -> Result<(), ValidationError> {
        if self.items.is_empty() {
            return Ok(());
        }
        Err(ValidationError {
            entity: self.entity,
            violations: self.items,
        })
    }
}

pub fn is_valid_email(value: &str) -> bool {
    EMAIL_RE.is_match(value)
}

#[cfg(test)]
mod tests {
    use super::{is_valid_email, Violations};

    #[test]
    fn email_check_accepts_common_shapes() {
        assert!(is_valid_email("a@x.com"));
        assert!(is_valid_email("A.B+c@sub.example.org"));
        assert!(!is_valid_email("a@x"));
        assert!(!is_valid_email("a x@y.com"));
    }

    #[test]
    fn finish_reports_one_violation_per_field() {
        let mut violations = Violations::new("project");
        violations.require_text("name", "  ");
        violations.optional_email("clientEmail", Some("nope"));
        violations.non_negative("budget", Some(-1.0));
        let err = violations.finish().unwrap_err();
        assert_eq!(err.violations.len(), 3);
        assert!(err.field("clientEmail").is_some());
        assert!(err.to_string().starts_with("invalid project:"));
    }
}
