//! The reminders gateway seam.
//!
//! Everything platform-specific lives behind [`RemindersGateway`]; the
//! pipeline only sees the narrow contract below. An in-memory fake for
//! tests lives in [`fake`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use taskbridge_core::types::{FieldKind, Priority, TaskStatus};
use thiserror::Error;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

/// Date components as the platform transmits them; time-of-day is ignored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateComponents {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl DateComponents {
    pub fn from_date(date: NaiveDate) -> Self {
        use chrono::Datelike;
        Self {
            year: date.year(),
            month: date.month(),
            day: date.day(),
        }
    }

    pub fn to_date(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

/// One item as enumerated from a reminders list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteItem {
    pub item_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub list_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due: Option<DateComponents>,
    /// Raw platform priority, 0–9.
    pub priority: u8,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

/// Field updates pushed to the gateway. Outer `Option` means "touch this
/// field"; for `due` the inner `None` clears the date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemFields {
    pub title: Option<String>,
    pub due: Option<Option<NaiveDate>>,
    pub priority: Option<Priority>,
    pub status: Option<TaskStatus>,
}

impl ItemFields {
    pub fn is_empty(&self) -> bool {
        *self == ItemFields::default()
    }
}

/// One field change the gateway actually applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedChange {
    pub field: FieldKind,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Per-field failure from an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub field: FieldKind,
    pub message: String,
}

/// Result of `update_item`.
#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    pub applied: Vec<AppliedChange>,
    pub errors: Vec<FieldError>,
}

/// Identifiers and timestamps of a newly created item.
#[derive(Debug, Clone)]
pub struct CreatedItem {
    pub item_id: String,
    pub external_id: Option<String>,
    pub list_id: String,
    pub created_at: DateTime<Utc>,
}

/// Enumeration result: items from healthy lists plus per-list errors.
#[derive(Debug, Clone, Default)]
pub struct ListOutcome {
    pub items: Vec<RemoteItem>,
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("list {0} unavailable: {1}")]
    ListUnavailable(String, String),

    #[error("item {0} not found")]
    ItemNotFound(String),

    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Transient failures are retried or degraded; the affected link is
    /// never retired over one.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_) | GatewayError::ListUnavailable(..) | GatewayError::Other(_)
        )
    }
}

/// The narrow contract every reminders adapter implements.
pub trait RemindersGateway {
    /// Enumerates items for the named lists. Failures are reported per
    /// list; healthy lists still return their items.
    fn list_items(&mut self, list_ids: &[String]) -> ListOutcome;

    /// Finds one item, optionally scoped to a list.
    fn find_item(
        &mut self,
        item_id: &str,
        list_id: Option<&str>,
    ) -> Result<Option<RemoteItem>, GatewayError>;

    /// Creates an item and returns its identifiers.
    fn create_item(&mut self, list_id: &str, fields: &ItemFields)
    -> Result<CreatedItem, GatewayError>;

    /// Applies field updates; `dry_run` reports without mutating.
    fn update_item(
        &mut self,
        item_id: &str,
        fields: &ItemFields,
        dry_run: bool,
    ) -> Result<UpdateOutcome, GatewayError>;

    /// Deletes an item; returns whether it existed.
    fn delete_item(&mut self, item_id: &str) -> Result<bool, GatewayError>;
}

/// Maps a raw platform priority (0–9) onto the common model.
///
/// The ramp is symmetric with [`priority_to_gateway`]: reading back a
/// written priority always recovers the original variant.
pub fn priority_from_gateway(raw: u8) -> Priority {
    match raw {
        0 => Priority::None,
        1..=2 => Priority::Highest,
        3..=4 => Priority::High,
        5..=6 => Priority::Medium,
        _ => Priority::Low,
    }
}

/// Maps a common-model priority onto the platform's 0–9 scale.
pub fn priority_to_gateway(priority: Priority) -> u8 {
    match priority {
        Priority::None => 0,
        Priority::Highest => 1,
        Priority::High => 3,
        Priority::Medium => 5,
        Priority::Low => 7,
    }
}
