use crate::domain::models::{
    ItemKind, ItemSource, Recurrence, RecurrenceMode, RecurrencePattern, RecurrenceRule,
    ScheduleItem, Termination, parse_weekday_tag, weekday_tag,
};
use crate::infrastructure::error::EngineError;
use crate::infrastructure::storage::open_connection;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Persistence capability the engine reads and writes schedule items through.
pub trait ItemRepository: Send + Sync {
    fn list_owner_ids(&self) -> Result<Vec<String>, EngineError>;
    fn find_by_owner(&self, owner_id: &str) -> Result<Vec<ScheduleItem>, EngineError>;
    fn find_by_external_id(
        &self,
        owner_id: &str,
        external_id: &str,
    ) -> Result<Option<ScheduleItem>, EngineError>;
    fn get_by_id(&self, item_id: &str) -> Result<Option<ScheduleItem>, EngineError>;
    fn insert(&self, item: &ScheduleItem) -> Result<(), EngineError>;
    fn update(&self, item: &ScheduleItem) -> Result<(), EngineError>;
    fn delete(&self, item_id: &str) -> Result<bool, EngineError>;
}

const ITEM_COLUMNS: &str = "id, owner_id, kind, title, description, start_at, end_at, \
     is_recurring, recurrence_pattern, recurrence_days, recurrence_end_date, recurrence_count, \
     recurrence_mode, recurrence_anchor, recurrence_inert, parent_id, source, external_id, \
     last_updated_at, synced_at, created_at";

#[derive(Debug, Clone)]
pub struct SqliteItemRepository {
    db_path: PathBuf,
}

impl SqliteItemRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, EngineError> {
        open_connection(&self.db_path)
    }

    fn query_items(
        connection: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Result<ScheduleItem, EngineError>>, EngineError> {
        let mut statement = connection.prepare(sql)?;
        let rows = statement
            .query_map(params, ItemRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(ItemRow::into_item).collect())
    }
}

impl ItemRepository for SqliteItemRepository {
    fn list_owner_ids(&self) -> Result<Vec<String>, EngineError> {
        let connection = self.connect()?;
        let mut statement =
            connection.prepare("SELECT DISTINCT owner_id FROM schedule_items ORDER BY owner_id")?;
        let owners = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(owners)
    }

    fn find_by_owner(&self, owner_id: &str) -> Result<Vec<ScheduleItem>, EngineError> {
        let connection = self.connect()?;
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM schedule_items WHERE owner_id = ?1 ORDER BY start_at, id"
        );
        let items = Self::query_items(&connection, &sql, &[&owner_id])?
            .into_iter()
            .filter_map(|item| match item {
                Ok(item) => Some(item),
                Err(error) => {
                    warn!(owner_id, %error, "skipping malformed schedule item row");
                    None
                }
            })
            .collect();
        Ok(items)
    }

    fn find_by_external_id(
        &self,
        owner_id: &str,
        external_id: &str,
    ) -> Result<Option<ScheduleItem>, EngineError> {
        let connection = self.connect()?;
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM schedule_items WHERE owner_id = ?1 AND external_id = ?2"
        );
        Self::query_items(&connection, &sql, &[&owner_id, &external_id])?
            .into_iter()
            .next()
            .transpose()
    }

    fn get_by_id(&self, item_id: &str) -> Result<Option<ScheduleItem>, EngineError> {
        let connection = self.connect()?;
        let sql = format!("SELECT {ITEM_COLUMNS} FROM schedule_items WHERE id = ?1");
        let row = connection
            .query_row(&sql, [item_id], ItemRow::from_row)
            .optional()?;
        row.map(ItemRow::into_item).transpose()
    }

    fn insert(&self, item: &ScheduleItem) -> Result<(), EngineError> {
        item.validate().map_err(EngineError::Validation)?;
        let connection = self.connect()?;
        let row = ItemRow::from_item(item);
        connection.execute(
            &format!(
                "INSERT INTO schedule_items ({ITEM_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18, ?19, ?20, ?21)"
            ),
            params![
                row.id,
                row.owner_id,
                row.kind,
                row.title,
                row.description,
                row.start_at,
                row.end_at,
                row.is_recurring,
                row.recurrence_pattern,
                row.recurrence_days,
                row.recurrence_end_date,
                row.recurrence_count,
                row.recurrence_mode,
                row.recurrence_anchor,
                row.recurrence_inert,
                row.parent_id,
                row.source,
                row.external_id,
                row.last_updated_at,
                row.synced_at,
                row.created_at,
            ],
        )?;
        Ok(())
    }

    fn update(&self, item: &ScheduleItem) -> Result<(), EngineError> {
        item.validate().map_err(EngineError::Validation)?;
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;

        let sql = format!("SELECT {ITEM_COLUMNS} FROM schedule_items WHERE id = ?1");
        let existing = transaction
            .query_row(&sql, [&item.id], ItemRow::from_row)
            .optional()?
            .ok_or_else(|| EngineError::Persistence(format!("item {} not found", item.id)))?;
        if let Some(current) = existing.external_id.as_deref() {
            if item.external_id.as_deref() != Some(current) {
                return Err(EngineError::Validation(format!(
                    "item {} external_id is immutable",
                    item.id
                )));
            }
        }

        let row = ItemRow::from_item(item);
        transaction.execute(
            "UPDATE schedule_items SET
               owner_id = ?2, kind = ?3, title = ?4, description = ?5, start_at = ?6,
               end_at = ?7, is_recurring = ?8, recurrence_pattern = ?9, recurrence_days = ?10,
               recurrence_end_date = ?11, recurrence_count = ?12, recurrence_mode = ?13,
               recurrence_anchor = ?14, recurrence_inert = ?15, parent_id = ?16, source = ?17,
               external_id = ?18, last_updated_at = ?19, synced_at = ?20, created_at = ?21
             WHERE id = ?1",
            params![
                row.id,
                row.owner_id,
                row.kind,
                row.title,
                row.description,
                row.start_at,
                row.end_at,
                row.is_recurring,
                row.recurrence_pattern,
                row.recurrence_days,
                row.recurrence_end_date,
                row.recurrence_count,
                row.recurrence_mode,
                row.recurrence_anchor,
                row.recurrence_inert,
                row.parent_id,
                row.source,
                row.external_id,
                row.last_updated_at,
                row.synced_at,
                row.created_at,
            ],
        )?;
        transaction.commit()?;
        Ok(())
    }

    fn delete(&self, item_id: &str) -> Result<bool, EngineError> {
        let connection = self.connect()?;
        let affected = connection.execute("DELETE FROM schedule_items WHERE id = ?1", [item_id])?;
        Ok(affected > 0)
    }
}

/// Flat column image of a schedule item.
#[derive(Debug, Clone)]
struct ItemRow {
    id: String,
    owner_id: String,
    kind: String,
    title: String,
    description: Option<String>,
    start_at: String,
    end_at: Option<String>,
    is_recurring: bool,
    recurrence_pattern: Option<String>,
    recurrence_days: Option<String>,
    recurrence_end_date: Option<String>,
    recurrence_count: Option<i64>,
    recurrence_mode: Option<String>,
    recurrence_anchor: Option<String>,
    recurrence_inert: bool,
    parent_id: Option<String>,
    source: String,
    external_id: Option<String>,
    last_updated_at: String,
    synced_at: Option<String>,
    created_at: String,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            kind: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            start_at: row.get(5)?,
            end_at: row.get(6)?,
            is_recurring: row.get(7)?,
            recurrence_pattern: row.get(8)?,
            recurrence_days: row.get(9)?,
            recurrence_end_date: row.get(10)?,
            recurrence_count: row.get(11)?,
            recurrence_mode: row.get(12)?,
            recurrence_anchor: row.get(13)?,
            recurrence_inert: row.get(14)?,
            parent_id: row.get(15)?,
            source: row.get(16)?,
            external_id: row.get(17)?,
            last_updated_at: row.get(18)?,
            synced_at: row.get(19)?,
            created_at: row.get(20)?,
        })
    }

    fn from_item(item: &ScheduleItem) -> Self {
        let recurrence = item.recurrence.as_ref();
        let rule = recurrence.map(|recurrence| &recurrence.rule);
        let (recurrence_end_date, recurrence_count) = match rule.map(|rule| rule.termination) {
            Some(Termination::Until(date)) => (Some(date.to_string()), None),
            Some(Termination::Count(count)) => (None, Some(i64::from(count))),
            Some(Termination::Never) | None => (None, None),
        };

        Self {
            id: item.id.clone(),
            owner_id: item.owner_id.clone(),
            kind: item.kind.as_str().to_string(),
            title: item.title.clone(),
            description: item.description.clone(),
            start_at: item.start_at.to_rfc3339(),
            end_at: item.end_at.map(|value| value.to_rfc3339()),
            is_recurring: recurrence.is_some(),
            recurrence_pattern: rule.map(|rule| rule.pattern.name().to_string()),
            recurrence_days: rule.and_then(|rule| rule.pattern.days()).map(|days| {
                days.iter()
                    .map(|day| weekday_tag(*day))
                    .collect::<Vec<_>>()
                    .join(",")
            }),
            recurrence_end_date,
            recurrence_count,
            recurrence_mode: recurrence.map(|recurrence| recurrence.mode.as_str().to_string()),
            recurrence_anchor: recurrence.map(|recurrence| recurrence.anchor.to_rfc3339()),
            recurrence_inert: recurrence.map(|recurrence| recurrence.inert).unwrap_or(false),
            parent_id: item.parent_id.clone(),
            source: item.source.as_str().to_string(),
            external_id: item.external_id.clone(),
            last_updated_at: item.last_updated_at.to_rfc3339(),
            synced_at: item.synced_at.map(|value| value.to_rfc3339()),
            created_at: item.created_at.to_rfc3339(),
        }
    }

    fn into_item(self) -> Result<ScheduleItem, EngineError> {
        let invalid = |message: String| EngineError::Validation(format!("item {}: {message}", self.id));

        let start_at = parse_timestamp(&self.start_at, "start_at").map_err(invalid)?;
        let recurrence = if self.is_recurring {
            Some(self.parse_recurrence(start_at).map_err(invalid)?)
        } else {
            if self.recurrence_pattern.is_some()
                || self.recurrence_days.is_some()
                || self.recurrence_end_date.is_some()
                || self.recurrence_count.is_some()
                || self.recurrence_mode.is_some()
            {
                return Err(invalid(
                    "recurrence columns set on a non-recurring item".to_string(),
                ));
            }
            None
        };

        let item = ScheduleItem {
            kind: ItemKind::parse(&self.kind).map_err(invalid)?,
            source: ItemSource::parse(&self.source).map_err(invalid)?,
            start_at,
            end_at: self
                .end_at
                .as_deref()
                .map(|value| parse_timestamp(value, "end_at"))
                .transpose()
                .map_err(invalid)?,
            last_updated_at: parse_timestamp(&self.last_updated_at, "last_updated_at")
                .map_err(invalid)?,
            synced_at: self
                .synced_at
                .as_deref()
                .map(|value| parse_timestamp(value, "synced_at"))
                .transpose()
                .map_err(invalid)?,
            created_at: parse_timestamp(&self.created_at, "created_at").map_err(invalid)?,
            recurrence,
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            parent_id: self.parent_id.clone(),
            external_id: self.external_id.clone(),
        };
        item.validate().map_err(invalid)?;
        Ok(item)
    }

    fn parse_recurrence(&self, start_at: DateTime<Utc>) -> Result<Recurrence, String> {
        let pattern_name = self
            .recurrence_pattern
            .as_deref()
            .ok_or_else(|| "recurrence_pattern is required for recurring items".to_string())?;

        let pattern = match pattern_name.trim().to_ascii_lowercase().as_str() {
            "daily" => RecurrencePattern::Daily,
            "weekly" => {
                let raw = self
                    .recurrence_days
                    .as_deref()
                    .ok_or_else(|| "recurrence_days is required for weekly pattern".to_string())?;
                let days = raw
                    .split(',')
                    .filter(|tag| !tag.trim().is_empty())
                    .map(parse_weekday_tag)
                    .collect::<Result<Vec<_>, _>>()?;
                RecurrencePattern::weekly(days)
            }
            "monthly" => RecurrencePattern::Monthly,
            "yearly" => RecurrencePattern::Yearly,
            other => return Err(format!("invalid recurrence_pattern: {other}")),
        };
        if !matches!(pattern, RecurrencePattern::Weekly(_)) && self.recurrence_days.is_some() {
            return Err("recurrence_days is only allowed for weekly pattern".to_string());
        }

        let termination = match (self.recurrence_end_date.as_deref(), self.recurrence_count) {
            (None, None) => Termination::Never,
            (Some(end_date), None) => Termination::Until(
                NaiveDate::parse_from_str(end_date, "%Y-%m-%d")
                    .map_err(|error| format!("invalid recurrence_end_date '{end_date}': {error}"))?,
            ),
            (None, Some(count)) => Termination::Count(
                u32::try_from(count).map_err(|_| format!("invalid recurrence_count {count}"))?,
            ),
            (Some(_), Some(_)) => {
                return Err("only one termination condition may be set".to_string());
            }
        };

        let mode = self
            .recurrence_mode
            .as_deref()
            .map(RecurrenceMode::parse)
            .transpose()?
            .unwrap_or(RecurrenceMode::Clone);
        let anchor = self
            .recurrence_anchor
            .as_deref()
            .map(|value| parse_timestamp(value, "recurrence_anchor"))
            .transpose()?
            .unwrap_or(start_at);

        let rule = RecurrenceRule {
            pattern,
            termination,
        };
        rule.validate()?;
        Ok(Recurrence {
            rule,
            mode,
            anchor,
            inert: self.recurrence_inert,
        })
    }
}

fn parse_timestamp(value: &str, field_name: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| format!("invalid {field_name} '{value}': {error}"))
}

#[derive(Debug, Default)]
pub struct InMemoryItemRepository {
    items: Mutex<HashMap<String, ScheduleItem>>,
}

impl InMemoryItemRepository {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ScheduleItem>>, EngineError> {
        self.items
            .lock()
            .map_err(|error| EngineError::Persistence(format!("item store lock poisoned: {error}")))
    }
}

impl ItemRepository for InMemoryItemRepository {
    fn list_owner_ids(&self) -> Result<Vec<String>, EngineError> {
        let items = self.lock()?;
        let owners = items
            .values()
            .map(|item| item.owner_id.clone())
            .collect::<BTreeSet<_>>();
        Ok(owners.into_iter().collect())
    }

    fn find_by_owner(&self, owner_id: &str) -> Result<Vec<ScheduleItem>, EngineError> {
        let items = self.lock()?;
        let mut owned = items
            .values()
            .filter(|item| item.owner_id == owner_id)
            .cloned()
            .collect::<Vec<_>>();
        owned.sort_by(|left, right| {
            left.start_at
                .cmp(&right.start_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(owned)
    }

    fn find_by_external_id(
        &self,
        owner_id: &str,
        external_id: &str,
    ) -> Result<Option<ScheduleItem>, EngineError> {
        let items = self.lock()?;
        Ok(items
            .values()
            .find(|item| {
                item.owner_id == owner_id && item.external_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    fn get_by_id(&self, item_id: &str) -> Result<Option<ScheduleItem>, EngineError> {
        let items = self.lock()?;
        Ok(items.get(item_id).cloned())
    }

    fn insert(&self, item: &ScheduleItem) -> Result<(), EngineError> {
        item.validate().map_err(EngineError::Validation)?;
        let mut items = self.lock()?;
        if items.contains_key(&item.id) {
            return Err(EngineError::Persistence(format!(
                "item {} already exists",
                item.id
            )));
        }
        items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    fn update(&self, item: &ScheduleItem) -> Result<(), EngineError> {
        item.validate().map_err(EngineError::Validation)?;
        let mut items = self.lock()?;
        let existing = items
            .get(&item.id)
            .ok_or_else(|| EngineError::Persistence(format!("item {} not found", item.id)))?;
        existing
            .ensure_external_id_stable(item)
            .map_err(EngineError::Validation)?;
        items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    fn delete(&self, item_id: &str) -> Result<bool, EngineError> {
        let mut items = self.lock()?;
        let removed = items.remove(item_id).is_some();
        items.retain(|_, item| item.parent_id.as_deref() != Some(item_id));
        Ok(removed)
    }
}
