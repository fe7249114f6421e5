use crate::domain::models::{RemoteItem, ScheduleItem};
use crate::infrastructure::error::EngineError;
use crate::infrastructure::event_mapper::{
    GoogleCalendarEvent, decode_remote_item, encode_schedule_item,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use url::Url;

const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3/";

#[derive(Debug, Clone, Default)]
pub struct ListEventsRequest {
    /// Provider checkpoint; `None` requests a full listing.
    pub sync_token: Option<String>,
}

/// Remote entry that could not be mapped into a `RemoteItem`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRemoteItem {
    pub external_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListEventsResponse {
    pub items: Vec<RemoteItem>,
    pub malformed: Vec<MalformedRemoteItem>,
    pub next_sync_token: Option<String>,
}

/// External calendar capability used by the reconciler.
#[async_trait]
pub trait CalendarClient: Send + Sync {
    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse, EngineError>;

    /// Returns the provider-assigned id of the new event.
    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        item: &ScheduleItem,
    ) -> Result<String, EngineError>;

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        external_id: &str,
        item: &ScheduleItem,
    ) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestGoogleCalendarClient {
    client: Client,
    api_base: String,
}

impl Default for ReqwestGoogleCalendarClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestGoogleCalendarClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            api_base: CALENDAR_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), EngineError> {
        if value.trim().is_empty() {
            return Err(EngineError::Validation(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn events_endpoint(&self, calendar_id: &str) -> Result<Url, EngineError> {
        let mut url = Url::parse(&self.api_base).map_err(|error| {
            EngineError::InvalidConfig(format!("invalid calendar api base url: {error}"))
        })?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                EngineError::InvalidConfig("calendar api base URL cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("calendars");
            segments.push(calendar_id);
            segments.push("events");
        }
        Ok(url)
    }

    fn event_endpoint(&self, calendar_id: &str, event_id: &str) -> Result<Url, EngineError> {
        let mut url = self.events_endpoint(calendar_id)?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                EngineError::InvalidConfig("calendar events URL cannot be a base".to_string())
            })?;
            segments.push(event_id);
        }
        Ok(url)
    }

    async fn read_body(response: reqwest::Response, action: &str) -> Result<(StatusCode, String), EngineError> {
        let status = response.status();
        let body = response.text().await.map_err(|error| {
            EngineError::Network(format!("failed reading {action} response: {error}"))
        })?;
        Ok((status, body))
    }
}

fn http_error(status: StatusCode, body: &str) -> EngineError {
    let message = if body.trim().is_empty() {
        format!("google calendar api error: http {}", status.as_u16())
    } else {
        format!(
            "google calendar api error: http {}; body={body}",
            status.as_u16()
        )
    };
    match status {
        StatusCode::FORBIDDEN if is_rate_limited(body) => EngineError::Network(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EngineError::Auth(message),
        StatusCode::GONE => EngineError::SyncTokenExpired,
        StatusCode::TOO_MANY_REQUESTS => EngineError::Network(message),
        status if status.is_server_error() => EngineError::Network(message),
        _ => EngineError::Validation(message),
    }
}

const RATE_LIMIT_REASONS: [&str; 2] = ["rateLimitExceeded", "userRateLimitExceeded"];

/// Google reports quota exhaustion as 403 with a reason in `error.errors[]`.
fn is_rate_limited(body: &str) -> bool {
    let Ok(payload) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    let errors = payload
        .pointer("/error/errors")
        .or_else(|| payload.get("errors"))
        .and_then(serde_json::Value::as_array);
    errors.is_some_and(|errors| {
        errors.iter().any(|error| {
            error
                .get("reason")
                .and_then(serde_json::Value::as_str)
                .is_some_and(|reason| RATE_LIMIT_REASONS.contains(&reason))
        })
    })
}

#[derive(Debug, serde::Deserialize)]
struct EventsPageResponse {
    items: Option<Vec<GoogleCalendarEvent>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "nextSyncToken")]
    next_sync_token: Option<String>,
}

fn collect_page(events: Vec<GoogleCalendarEvent>, response: &mut ListEventsResponse) {
    for event in events {
        match decode_remote_item(&event) {
            Ok(item) => response.items.push(item),
            Err(error) => response.malformed.push(MalformedRemoteItem {
                external_id: event.id.clone(),
                reason: error.to_string(),
            }),
        }
    }
}

#[async_trait]
impl CalendarClient for ReqwestGoogleCalendarClient {
    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse, EngineError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;

        let endpoint = self.events_endpoint(calendar_id)?;
        let mut page_token: Option<String> = None;
        let mut listing = ListEventsResponse::default();

        loop {
            let mut req = self.client.get(endpoint.clone()).bearer_auth(access_token);
            req = req.query(&[("showDeleted", "true"), ("maxResults", "2500")]);
            if let Some(sync_token) = request.sync_token.as_deref() {
                req = req.query(&[("syncToken", sync_token)]);
            }
            if let Some(page_token) = page_token.as_deref() {
                req = req.query(&[("pageToken", page_token)]);
            }

            let response = req.send().await.map_err(|error| {
                EngineError::Network(format!("network error while listing calendar events: {error}"))
            })?;
            let (status, body) = Self::read_body(response, "events list").await?;
            if !status.is_success() {
                return Err(http_error(status, &body));
            }

            let mut parsed: EventsPageResponse = serde_json::from_str(&body).map_err(|error| {
                EngineError::Validation(format!("invalid events list payload: {error}"))
            })?;

            collect_page(parsed.items.take().unwrap_or_default(), &mut listing);
            if parsed.next_sync_token.is_some() {
                listing.next_sync_token = parsed.next_sync_token.take();
            }

            if let Some(next_page_token) = parsed.next_page_token.take() {
                page_token = Some(next_page_token);
                continue;
            }
            break;
        }

        Ok(listing)
    }

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        item: &ScheduleItem,
    ) -> Result<String, EngineError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;

        let endpoint = self.events_endpoint(calendar_id)?;
        let response = self
            .client
            .post(endpoint)
            .bearer_auth(access_token)
            .json(&encode_schedule_item(item))
            .send()
            .await
            .map_err(|error| {
                EngineError::Network(format!("network error while creating event: {error}"))
            })?;
        let (status, body) = Self::read_body(response, "event create").await?;
        if !status.is_success() {
            return Err(http_error(status, &body));
        }

        let parsed: GoogleCalendarEvent = serde_json::from_str(&body).map_err(|error| {
            EngineError::Validation(format!("invalid event create payload: {error}"))
        })?;
        parsed
            .id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                EngineError::Validation("event create response did not include id".to_string())
            })
    }

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        external_id: &str,
        item: &ScheduleItem,
    ) -> Result<(), EngineError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(external_id, "event id")?;

        let endpoint = self.event_endpoint(calendar_id, external_id)?;
        let response = self
            .client
            .patch(endpoint)
            .bearer_auth(access_token)
            .json(&encode_schedule_item(item))
            .send()
            .await
            .map_err(|error| {
                EngineError::Network(format!("network error while updating event: {error}"))
            })?;
        let (status, body) = Self::read_body(response, "event update").await?;
        if !status.is_success() {
            return Err(http_error(status, &body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::error::ErrorCategory;
    use crate::infrastructure::event_mapper::CalendarEventDateTime;

    #[test]
    fn status_codes_map_onto_error_taxonomy() {
        assert!(matches!(
            http_error(StatusCode::UNAUTHORIZED, ""),
            EngineError::Auth(_)
        ));
        assert!(matches!(
            http_error(StatusCode::GONE, "fullSyncRequired"),
            EngineError::SyncTokenExpired
        ));
        assert!(http_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(http_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(matches!(
            http_error(StatusCode::BAD_REQUEST, "{\"error\":\"invalid\"}"),
            EngineError::Validation(message) if message.contains("http 400")
        ));
    }

    #[test]
    fn event_endpoint_escapes_calendar_id() {
        let client = ReqwestGoogleCalendarClient::new();
        let url = client
            .event_endpoint("team@group.calendar.google.com", "abc 123")
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "https://www.googleapis.com/calendar/v3/calendars/team@group.calendar.google.com/events/abc%20123"
        );
    }

    #[test]
    fn malformed_entries_are_reported_not_dropped() {
        let good = GoogleCalendarEvent {
            id: Some("remote-1".to_string()),
            summary: Some("Dentist".to_string()),
            updated: Some("2025-01-06T09:00:00Z".to_string()),
            start: Some(CalendarEventDateTime {
                date_time: Some("2025-01-07T09:00:00Z".to_string()),
                ..CalendarEventDateTime::default()
            }),
            end: Some(CalendarEventDateTime {
                date_time: Some("2025-01-07T10:00:00Z".to_string()),
                ..CalendarEventDateTime::default()
            }),
            ..GoogleCalendarEvent::default()
        };
        let bad = GoogleCalendarEvent {
            id: Some("remote-2".to_string()),
            updated: Some("2025-01-06T09:00:00Z".to_string()),
            ..GoogleCalendarEvent::default()
        };

        let mut listing = ListEventsResponse::default();
        collect_page(vec![good, bad], &mut listing);

        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.malformed.len(), 1);
        assert_eq!(listing.malformed[0].external_id.as_deref(), Some("remote-2"));
    }

    #[test]
    fn forbidden_rate_limit_is_transient() {
        let body = r#"{"error":{"code":403,"errors":[{"domain":"usageLimits","reason":"rateLimitExceeded"}]}}"#;
        let error = http_error(StatusCode::FORBIDDEN, body);
        assert!(error.is_transient());
        assert_eq!(error.category(), ErrorCategory::Network);

        let user_limit = r#"{"errors":[{"reason":"userRateLimitExceeded"}]}"#;
        assert!(http_error(StatusCode::FORBIDDEN, user_limit).is_transient());

        let denied = r#"{"error":{"errors":[{"reason":"forbidden"}]}}"#;
        assert_eq!(
            http_error(StatusCode::FORBIDDEN, denied).category(),
            ErrorCategory::Auth
        );
        assert_eq!(
            http_error(StatusCode::FORBIDDEN, "not json").category(),
            ErrorCategory::Auth
        );
    }
}
