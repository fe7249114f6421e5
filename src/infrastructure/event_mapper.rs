use crate::domain::models::{ItemKind, RemoteItem, ScheduleItem};
use crate::infrastructure::error::EngineError;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;

const KEY_ITEM_ID: &str = "cadence_item_id";
const KEY_KIND: &str = "cadence_kind";
const STATUS_CANCELLED: &str = "cancelled";
const UNTITLED: &str = "(untitled)";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct CalendarEventDateTime {
    #[serde(rename = "dateTime", skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    /// All-day events carry a date instead of a date-time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(rename = "timeZone", skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct CalendarEventExtendedProperties {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub private: HashMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct GoogleCalendarEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    // Cancelled entries in an incremental listing carry no times.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<CalendarEventDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<CalendarEventDateTime>,
    #[serde(rename = "extendedProperties", skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<CalendarEventExtendedProperties>,
}

pub fn encode_schedule_item(item: &ScheduleItem) -> GoogleCalendarEvent {
    let mut private = HashMap::new();
    private.insert(KEY_ITEM_ID.to_string(), item.id.clone());
    private.insert(KEY_KIND.to_string(), item.kind.as_str().to_string());

    GoogleCalendarEvent {
        id: None,
        summary: Some(item.title.clone()),
        description: item
            .description
            .clone()
            .filter(|description| !description.is_empty()),
        status: Some("confirmed".to_string()),
        updated: None,
        start: Some(CalendarEventDateTime {
            date_time: Some(item.start_at.to_rfc3339()),
            ..CalendarEventDateTime::default()
        }),
        end: Some(CalendarEventDateTime {
            date_time: Some(item.end_at.unwrap_or(item.start_at).to_rfc3339()),
            ..CalendarEventDateTime::default()
        }),
        extended_properties: Some(CalendarEventExtendedProperties { private }),
    }
}

pub fn decode_remote_item(event: &GoogleCalendarEvent) -> Result<RemoteItem, EngineError> {
    let external_id = event
        .id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| EngineError::Validation("calendar event has no id".to_string()))?
        .to_string();

    let private = event
        .extended_properties
        .as_ref()
        .map(|properties| &properties.private);
    let local_item_id = private
        .and_then(|private| private.get(KEY_ITEM_ID))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned);
    let kind = private
        .and_then(|private| private.get(KEY_KIND))
        .map(|value| ItemKind::parse(value))
        .transpose()
        .map_err(EngineError::Validation)?;

    let cancelled = event.status.as_deref() == Some(STATUS_CANCELLED);
    let updated_at = match event.updated.as_deref() {
        Some(value) => parse_rfc3339_utc(value, "updated")?,
        None if cancelled => DateTime::<Utc>::UNIX_EPOCH,
        None => {
            return Err(EngineError::Validation(format!(
                "calendar event {external_id} has no updated timestamp"
            )));
        }
    };

    if cancelled {
        return Ok(RemoteItem {
            external_id,
            title: event.summary.clone().unwrap_or_default(),
            description: event.description.clone(),
            start_at: updated_at,
            end_at: updated_at,
            updated_at,
            cancelled,
            local_item_id,
            kind,
        });
    }

    let start_at = parse_event_time(event.start.as_ref(), "start")?;
    let end_at = parse_event_time(event.end.as_ref(), "end")?;
    let item = RemoteItem {
        title: event
            .summary
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(UNTITLED)
            .to_string(),
        description: event.description.clone(),
        external_id,
        start_at,
        end_at,
        updated_at,
        cancelled,
        local_item_id,
        kind,
    };
    item.validate().map_err(EngineError::Validation)?;
    Ok(item)
}

fn parse_event_time(
    value: Option<&CalendarEventDateTime>,
    field_name: &str,
) -> Result<DateTime<Utc>, EngineError> {
    let value = value.ok_or_else(|| {
        EngineError::Validation(format!("calendar event has no {field_name}"))
    })?;
    if let Some(date_time) = value.date_time.as_deref() {
        return parse_rfc3339_utc(date_time, &format!("{field_name}.dateTime"));
    }
    if let Some(date) = value.date.as_deref() {
        let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|error| {
            EngineError::Validation(format!(
                "invalid calendar event {field_name}.date '{date}': {error}"
            ))
        })?;
        return Ok(parsed.and_time(chrono::NaiveTime::MIN).and_utc());
    }
    Err(EngineError::Validation(format!(
        "calendar event {field_name} has neither dateTime nor date"
    )))
}

fn parse_rfc3339_utc(value: &str, field_name: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(value)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| {
            EngineError::Validation(format!(
                "invalid calendar event {field_name} '{value}': {error}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ItemSource;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn sample_item() -> ScheduleItem {
        ScheduleItem {
            id: "itm-1".to_string(),
            owner_id: "user-1".to_string(),
            kind: ItemKind::Task,
            title: "Write report".to_string(),
            description: Some("quarterly".to_string()),
            start_at: fixed_time("2025-01-06T09:00:00Z"),
            end_at: None,
            recurrence: None,
            parent_id: None,
            source: ItemSource::Local,
            external_id: None,
            last_updated_at: fixed_time("2025-01-05T12:00:00Z"),
            synced_at: None,
            created_at: fixed_time("2025-01-05T12:00:00Z"),
        }
    }

    #[test]
    fn pushed_event_carries_local_identity() {
        let mut event = encode_schedule_item(&sample_item());
        event.id = Some("remote-1".to_string());
        event.updated = Some("2025-01-06T09:30:00Z".to_string());

        let remote = decode_remote_item(&event).expect("decode");
        assert_eq!(remote.external_id, "remote-1");
        assert_eq!(remote.local_item_id.as_deref(), Some("itm-1"));
        assert_eq!(remote.kind, Some(ItemKind::Task));
        assert_eq!(remote.end_at, remote.start_at);
        assert!(sample_item().same_content_as(&remote));
    }

    #[test]
    fn cancelled_entry_without_times_decodes() {
        let event = GoogleCalendarEvent {
            id: Some("remote-2".to_string()),
            status: Some("cancelled".to_string()),
            ..GoogleCalendarEvent::default()
        };
        let remote = decode_remote_item(&event).expect("decode");
        assert!(remote.cancelled);
        assert_eq!(remote.local_item_id, None);
    }

    #[test]
    fn all_day_event_starts_at_midnight_utc() {
        let event = GoogleCalendarEvent {
            id: Some("remote-3".to_string()),
            summary: Some("Holiday".to_string()),
            updated: Some("2025-01-01T00:00:00Z".to_string()),
            start: Some(CalendarEventDateTime {
                date: Some("2025-01-06".to_string()),
                ..CalendarEventDateTime::default()
            }),
            end: Some(CalendarEventDateTime {
                date: Some("2025-01-07".to_string()),
                ..CalendarEventDateTime::default()
            }),
            ..GoogleCalendarEvent::default()
        };
        let remote = decode_remote_item(&event).expect("decode");
        assert_eq!(remote.start_at, fixed_time("2025-01-06T00:00:00Z"));
        assert_eq!(remote.end_at, fixed_time("2025-01-07T00:00:00Z"));
    }

    #[test]
    fn invalid_timestamp_is_a_validation_error() {
        let mut event = encode_schedule_item(&sample_item());
        event.id = Some("remote-4".to_string());
        event.updated = Some("2025-01-06T09:30:00Z".to_string());
        event.start = Some(CalendarEventDateTime {
            date_time: Some("invalid-timestamp".to_string()),
            ..CalendarEventDateTime::default()
        });

        assert!(matches!(
            decode_remote_item(&event),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn echo_of_pushed_item_matches_local_content() {
        let mut item = sample_item();
        item.title = "  Standup ".to_string();
        item.description = Some(String::new());

        let mut event = encode_schedule_item(&item);
        assert_eq!(event.description, None);
        event.id = Some("remote-5".to_string());
        event.updated = Some("2025-01-06T09:30:00Z".to_string());

        let remote = decode_remote_item(&event).expect("decode");
        assert_eq!(remote.title, "  Standup ");
        assert!(item.same_content_as(&remote));
    }

    #[test]
    fn blank_summary_decodes_as_untitled() {
        let mut event = encode_schedule_item(&sample_item());
        event.id = Some("remote-6".to_string());
        event.updated = Some("2025-01-06T09:30:00Z".to_string());
        event.summary = Some("   ".to_string());

        let remote = decode_remote_item(&event).expect("decode");
        assert_eq!(remote.title, UNTITLED);
    }
}
