use chrono::{DateTime, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Task,
    Event,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Event => "event",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "task" => Ok(Self::Task),
            "event" => Ok(Self::Event),
            other => Err(format!("invalid item kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemSource {
    Local,
    External,
}

impl ItemSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::External => "external",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "external" => Ok(Self::External),
            other => Err(format!("invalid item source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceMode {
    Clone,
    Refresh,
}

impl RecurrenceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Refresh => "refresh",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "clone" => Ok(Self::Clone),
            "refresh" => Ok(Self::Refresh),
            other => Err(format!("invalid recurrence mode: {other}")),
        }
    }
}

/// How a definition repeats. Only the weekly pattern carries a weekday set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "pattern", content = "days", rename_all = "snake_case")]
pub enum RecurrencePattern {
    Daily,
    Weekly(Vec<Weekday>),
    Monthly,
    Yearly,
}

impl RecurrencePattern {
    pub fn weekly(days: impl IntoIterator<Item = Weekday>) -> Self {
        Self::Weekly(normalize_weekdays(days))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly(_) => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    pub fn days(&self) -> Option<&[Weekday]> {
        match self {
            Self::Weekly(days) => Some(days),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Termination {
    Never,
    Until(NaiveDate),
    Count(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub pattern: RecurrencePattern,
    pub termination: Termination,
}

impl RecurrenceRule {
    pub fn validate(&self) -> Result<(), String> {
        if let RecurrencePattern::Weekly(days) = &self.pattern {
            if days.is_empty() {
                return Err("recurrence.days must not be empty for weekly pattern".to_string());
            }
        }
        if let Termination::Count(0) = self.termination {
            return Err("recurrence.count must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Recurrence state carried by a definition row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recurrence {
    pub rule: RecurrenceRule,
    pub mode: RecurrenceMode,
    /// First instant of the series; stepping is always computed from here.
    pub anchor: DateTime<Utc>,
    /// Set once the termination condition is satisfied.
    pub inert: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleItem {
    pub id: String,
    pub owner_id: String,
    pub kind: ItemKind,
    pub title: String,
    pub description: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub recurrence: Option<Recurrence>,
    pub parent_id: Option<String>,
    pub source: ItemSource,
    pub external_id: Option<String>,
    pub last_updated_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduleItem {
    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    pub fn is_definition(&self) -> bool {
        self.recurrence.is_some() && self.parent_id.is_none()
    }

    pub fn is_occurrence(&self) -> bool {
        self.parent_id.is_some()
    }

    pub fn is_active_definition(&self) -> bool {
        self.is_definition()
            && self
                .recurrence
                .as_ref()
                .map(|recurrence| !recurrence.inert)
                .unwrap_or(false)
    }

    /// Edited locally since the last reconciliation with the remote copy.
    pub fn is_dirty(&self) -> bool {
        match self.synced_at {
            Some(synced_at) => self.last_updated_at > synced_at,
            None => true,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.end_at.map(|end_at| end_at - self.start_at)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "item.id")?;
        validate_non_empty(&self.owner_id, "item.owner_id")?;
        validate_non_empty(&self.title, "item.title")?;
        if let Some(end_at) = self.end_at {
            if end_at < self.start_at {
                return Err("item.end_at must be >= item.start_at".to_string());
            }
        }
        if let Some(parent_id) = self.parent_id.as_deref() {
            validate_non_empty(parent_id, "item.parent_id")?;
            if self.recurrence.is_some() {
                return Err("generated occurrence must not carry a recurrence rule".to_string());
            }
            if parent_id == self.id {
                return Err("item.parent_id must not reference itself".to_string());
            }
        }
        if let Some(recurrence) = &self.recurrence {
            recurrence.rule.validate()?;
            if recurrence.anchor > self.start_at {
                return Err("recurrence.anchor must not be after item.start_at".to_string());
            }
        }
        if let Some(external_id) = self.external_id.as_deref() {
            validate_non_empty(external_id, "item.external_id")?;
        }
        Ok(())
    }

    /// Rejects an update that would reassign an already assigned external id.
    pub fn ensure_external_id_stable(&self, updated: &ScheduleItem) -> Result<(), String> {
        match (self.external_id.as_deref(), updated.external_id.as_deref()) {
            (Some(current), Some(next)) if current != next => Err(format!(
                "item {} external_id is immutable ({current} -> {next})",
                self.id
            )),
            (Some(current), None) => Err(format!(
                "item {} external_id is immutable ({current} -> none)",
                self.id
            )),
            _ => Ok(()),
        }
    }

    /// True when the user-visible fields shared with the remote copy match.
    pub fn same_content_as(&self, remote: &RemoteItem) -> bool {
        self.title == remote.title
            && non_empty(self.description.as_deref()) == non_empty(remote.description.as_deref())
            && self.start_at == remote.start_at
            && self.end_at.unwrap_or(self.start_at) == remote.end_at
    }
}

/// An item as reported by the external calendar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteItem {
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancelled: bool,
    /// Local id stamped on items this application pushed.
    pub local_item_id: Option<String>,
    pub kind: Option<ItemKind>,
}

impl RemoteItem {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.external_id, "remote.external_id")?;
        if self.cancelled {
            return Ok(());
        }
        if self.end_at < self.start_at {
            return Err(format!(
                "remote item {} ends before it starts",
                self.external_id
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
    pub scope: Option<String>,
}

impl OAuthToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>, leeway_seconds: i64) -> bool {
        self.expires_at > now + Duration::seconds(leeway_seconds)
            && !self.access_token.trim().is_empty()
    }
}

pub fn normalize_weekdays(days: impl IntoIterator<Item = Weekday>) -> Vec<Weekday> {
    let mut days = days.into_iter().collect::<Vec<_>>();
    days.sort_by_key(Weekday::num_days_from_monday);
    days.dedup();
    days
}

pub fn weekday_tag(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

pub fn parse_weekday_tag(value: &str) -> Result<Weekday, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "mon" | "monday" => Ok(Weekday::Mon),
        "tue" | "tuesday" => Ok(Weekday::Tue),
        "wed" | "wednesday" => Ok(Weekday::Wed),
        "thu" | "thursday" => Ok(Weekday::Thu),
        "fri" | "friday" => Ok(Weekday::Fri),
        "sat" | "saturday" => Ok(Weekday::Sat),
        "sun" | "sunday" => Ok(Weekday::Sun),
        other => Err(format!("invalid weekday tag: {other}")),
    }
}

// The provider drops empty descriptions, so an empty one equals none.
fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
