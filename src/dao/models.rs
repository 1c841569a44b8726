use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, macros::format_description};
use utoipa::ToSchema;

/// Time limit applied to a stored question that has none.
pub const DEFAULT_TIME_LIMIT_SECONDS: u32 = 15;

/// A stored row. Every row is a JSON object carrying a string `id` column.
pub type Row = Value;

/// Column assignments applied by an update.
pub type Patch = Map<String, Value>;

/// Logical tables of the session store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// One row per session.
    Games,
    /// One row per participant, including the host.
    Players,
    /// The question bank of every session.
    GameQuestions,
}

impl Table {
    /// Name of the table as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Games => "games",
            Table::Players => "players",
            Table::GameQuestions => "game_questions",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session record stored in [`Table::Games`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameRecord {
    /// Six character session code, also the primary key.
    pub id: String,
    /// Player id of the host. Older rows may lack it.
    #[serde(default)]
    pub host_id: Option<String>,
    /// Display name the host chose when creating the session.
    pub host_name: String,
    /// Whether the host left the lobby.
    #[serde(default)]
    pub is_started: bool,
    /// Whether every question has been played.
    #[serde(default)]
    pub is_finished: bool,
    /// Index of the live (or last) question.
    #[serde(default)]
    pub current_question_index: usize,
    /// Whether the results of the current question are shown.
    #[serde(default)]
    pub show_results: bool,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: String,
    /// Last time the host wrote the record.
    #[serde(default)]
    pub updated_at: String,
}

impl GameRecord {
    /// Fresh lobby record for a newly created session.
    pub fn new(id: String, host_id: String, host_name: String) -> Self {
        let now = timestamp_now();
        Self {
            id,
            host_id: Some(host_id),
            host_name,
            is_started: false,
            is_finished: false,
            current_question_index: 0,
            show_results: false,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Merge an update payload into the record, ignoring unknown columns.
    pub fn merge(&mut self, row: &Row) -> serde_json::Result<()> {
        let mut current = serde_json::to_value(&*self)?;
        if let (Some(target), Some(source)) = (current.as_object_mut(), row.as_object()) {
            for (column, value) in source {
                if target.contains_key(column) {
                    target.insert(column.clone(), value.clone());
                }
            }
        }
        *self = serde_json::from_value(current)?;
        Ok(())
    }

    /// Whether `row` was written no earlier than this record.
    ///
    /// Rows without `updated_at` are always considered current.
    pub fn is_stale(&self, row: &Row) -> bool {
        row.get("updated_at")
            .and_then(Value::as_str)
            .is_some_and(|stamp| stamp < self.updated_at.as_str())
    }
}

/// Participant record stored in [`Table::Players`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerRecord {
    /// Opaque player id (UUID v4).
    pub id: String,
    /// Session code the player belongs to.
    pub game_id: String,
    /// Display name.
    pub name: String,
    /// Cumulative score.
    #[serde(default)]
    pub score: u32,
    /// Option picked for the current question.
    #[serde(default)]
    pub current_answer: Option<usize>,
    /// Seconds between question reveal and submission.
    #[serde(default)]
    pub time_to_answer: Option<f64>,
    /// Index of the question `current_answer` was given to.
    #[serde(default)]
    pub answered_question: Option<usize>,
    /// Join timestamp, orders the player list.
    #[serde(default)]
    pub joined_at: String,
}

impl PlayerRecord {
    /// Fresh row for a player joining `game_id`.
    pub fn new(id: String, game_id: String, name: String) -> Self {
        Self {
            id,
            game_id,
            name,
            score: 0,
            current_answer: None,
            time_to_answer: None,
            answered_question: None,
            joined_at: timestamp_now(),
        }
    }
}

/// Question record stored in [`Table::GameQuestions`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionRecord {
    /// Row id.
    pub id: String,
    /// Session code the question belongs to.
    pub game_id: String,
    /// Position of the question inside the session.
    pub question_index: usize,
    /// Prompt text.
    pub question: String,
    /// Answer options in display order.
    pub options: Vec<String>,
    /// Index of the correct option.
    pub correct_answer: usize,
    /// Seconds allowed to answer.
    #[serde(default)]
    pub time_limit: Option<u32>,
}

impl QuestionRecord {
    /// Effective time limit, defaulting when the column is empty.
    pub fn time_limit_seconds(&self) -> u32 {
        self.time_limit.unwrap_or(DEFAULT_TIME_LIMIT_SECONDS)
    }
}

/// Conjunction of column equalities used to scope reads, writes and subscriptions.
///
/// An expected `null` also matches rows where the column is absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(Map<String, Value>);

impl Filter {
    /// Filter matching every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter matching rows where `column == value`.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(column, value)
    }

    /// Add another equality to the filter.
    pub fn and(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    /// Whether `row` satisfies every equality.
    pub fn matches(&self, row: &Row) -> bool {
        self.0.iter().all(|(column, expected)| match row.get(column) {
            Some(actual) => actual == expected,
            None => expected.is_null(),
        })
    }
}

/// Sort order applied by a select.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Column to sort on.
    pub column: String,
    /// Sort from the largest value down.
    #[serde(default)]
    pub descending: bool,
}

impl OrderBy {
    /// Ascending order on `column`.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    /// Compare two rows on the configured column.
    pub fn compare(&self, left: &Row, right: &Row) -> Ordering {
        let ordering = compare_values(left.get(&self.column), right.get(&self.column));
        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

/// Kind of mutation carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A row was inserted.
    Insert,
    /// A row was updated; `row` holds the new contents.
    Update,
    /// A row was deleted; `row` holds the last contents.
    Delete,
    /// The subscriber missed changes and must re-read the rows it follows.
    /// `row` is `null`.
    Resync,
}

/// Change notification fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChangeEvent {
    /// Table the row lives in.
    pub table: Table,
    /// Mutation kind.
    pub kind: ChangeKind,
    /// Row contents after (or, for deletes, before) the mutation.
    #[schema(value_type = Object)]
    pub row: Row,
}

/// Primary key of a row, if it carries one.
pub fn row_id(row: &Row) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

/// Timestamp used for `created_at`, `updated_at` and `joined_at` columns.
///
/// Fixed-width microseconds keep the strings sortable.
pub fn timestamp_now() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .unwrap_or_else(|_| "invalid-timestamp".into())
}

fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn filter_matches_every_equality() {
        let row = json!({"id": "p1", "game_id": "ABC123", "current_answer": null});

        assert!(Filter::all().matches(&row));
        assert!(Filter::eq("game_id", "ABC123").matches(&row));
        assert!(Filter::eq("game_id", "ABC123").and("id", "p1").matches(&row));
        assert!(!Filter::eq("game_id", "ABC123").and("id", "p2").matches(&row));
        assert!(Filter::eq("current_answer", Value::Null).matches(&row));
        assert!(Filter::eq("time_to_answer", Value::Null).matches(&row));
        assert!(!Filter::eq("score", 0).matches(&row));
    }

    #[test]
    fn order_by_sorts_numbers_and_strings() {
        let mut rows = vec![
            json!({"id": "b", "question_index": 2}),
            json!({"id": "c", "question_index": 0}),
            json!({"id": "a", "question_index": 1}),
        ];
        let order = OrderBy::asc("question_index");
        rows.sort_by(|l, r| order.compare(l, r));
        let ids: Vec<_> = rows.iter().filter_map(row_id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        let order = OrderBy {
            column: "id".into(),
            descending: true,
        };
        rows.sort_by(|l, r| order.compare(l, r));
        let ids: Vec<_> = rows.iter().filter_map(row_id).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn game_record_merge_keeps_unknown_columns_out() {
        let mut record = GameRecord::new("ABC123".into(), "host".into(), "Ada".into());
        record
            .merge(&json!({"show_results": true, "time_remaining": 12}))
            .unwrap();
        assert!(record.show_results);
        assert_eq!(record.host_id.as_deref(), Some("host"));
    }

    #[test]
    fn older_rows_are_stale() {
        let mut record = GameRecord::new("ABC123".into(), "host".into(), "Ada".into());
        record.updated_at = "2024-05-01T10:00:00.000000Z".into();

        assert!(record.is_stale(&json!({"updated_at": "2024-05-01T09:59:59.999999Z"})));
        assert!(!record.is_stale(&json!({"updated_at": "2024-05-01T10:00:00.000000Z"})));
        assert!(!record.is_stale(&json!({"show_results": true})));
    }

    #[test]
    fn missing_time_limit_defaults() {
        let record: QuestionRecord = serde_json::from_value(json!({
            "id": "q",
            "game_id": "ABC123",
            "question_index": 0,
            "question": "?",
            "options": ["a", "b"],
            "correct_answer": 1
        }))
        .unwrap();
        assert_eq!(record.time_limit_seconds(), DEFAULT_TIME_LIMIT_SECONDS);
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let stamp = timestamp_now();
        assert_eq!(stamp.len(), "2024-01-01T00:00:00.000000Z".len());
        assert!(stamp.ends_with('Z'));
    }
}
