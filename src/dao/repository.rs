use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::dao::{
    models::{
        ChangeEvent, Filter, GameRecord, OrderBy, Patch, PlayerRecord, QuestionRecord, Row, Table,
        timestamp_now,
    },
    session_store::SessionStore,
    storage::{StorageError, StorageResult},
};

/// Typed access to the session tables.
///
/// Every write is scoped to the rows it affects; the aggregate is never
/// written back as a whole.
#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn SessionStore>,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Insert a fresh session record; fails with a conflict when the code is taken.
    pub async fn insert_game(&self, game: &GameRecord) -> StorageResult<()> {
        self.store
            .insert(Table::Games, encode(Table::Games, game)?)
            .await
    }

    /// Fetch a session record by code.
    pub async fn find_game(&self, code: &str) -> StorageResult<Option<GameRecord>> {
        let rows = self
            .store
            .select(Table::Games, Filter::eq("id", code), None)
            .await?;
        rows.into_iter()
            .next()
            .map(|row| decode(Table::Games, row))
            .transpose()
    }

    /// Flag the session as started on its first question.
    pub async fn mark_started(&self, code: &str) -> StorageResult<Patch> {
        self.update_game(
            code,
            json!({
                "is_started": true,
                "current_question_index": 0,
                "show_results": false,
            }),
        )
        .await
    }

    /// Freeze answers and reveal the current question's results.
    pub async fn show_results(&self, code: &str) -> StorageResult<Patch> {
        self.update_game(code, json!({ "show_results": true })).await
    }

    /// Move the session onto question `index`.
    pub async fn advance_to(&self, code: &str, index: usize) -> StorageResult<Patch> {
        self.update_game(
            code,
            json!({
                "current_question_index": index,
                "show_results": false,
            }),
        )
        .await
    }

    /// Close the session after its last question.
    pub async fn mark_finished(&self, code: &str) -> StorageResult<Patch> {
        self.update_game(
            code,
            json!({
                "is_finished": true,
                "show_results": true,
            }),
        )
        .await
    }

    /// Patch the session record, stamping `updated_at`. Returns the columns written.
    async fn update_game(&self, code: &str, patch: Value) -> StorageResult<Patch> {
        let mut patch = into_patch(patch);
        patch.insert("updated_at".into(), Value::String(timestamp_now()));
        let affected = self
            .store
            .update(Table::Games, Filter::eq("id", code), patch.clone())
            .await?;
        require_row(affected, Table::Games, || format!("session `{code}`"))?;
        Ok(patch)
    }

    pub async fn insert_player(&self, player: &PlayerRecord) -> StorageResult<()> {
        self.store
            .insert(Table::Players, encode(Table::Players, player)?)
            .await
    }

    pub async fn find_player(&self, id: &str) -> StorageResult<Option<PlayerRecord>> {
        let rows = self
            .store
            .select(Table::Players, Filter::eq("id", id), None)
            .await?;
        rows.into_iter()
            .next()
            .map(|row| decode(Table::Players, row))
            .transpose()
    }

    /// Players of a session in join order.
    pub async fn list_players(&self, code: &str) -> StorageResult<Vec<PlayerRecord>> {
        let rows = self
            .store
            .select(
                Table::Players,
                Filter::eq("game_id", code),
                Some(OrderBy::asc("joined_at")),
            )
            .await?;
        decode_all(Table::Players, rows)
    }

    /// Write a player's answer to question `question` and the score that includes it.
    pub async fn record_answer(
        &self,
        player_id: &str,
        question: usize,
        answer_index: usize,
        latency_seconds: f64,
        score: u32,
    ) -> StorageResult<()> {
        let patch = into_patch(json!({
            "current_answer": answer_index,
            "time_to_answer": latency_seconds,
            "answered_question": question,
            "score": score,
        }));
        let affected = self
            .store
            .update(Table::Players, Filter::eq("id", player_id), patch)
            .await?;
        require_row(affected, Table::Players, || format!("player `{player_id}`"))
    }

    /// Clear every player's answer before the next question.
    pub async fn clear_answers(&self, code: &str) -> StorageResult<()> {
        let patch = into_patch(json!({
            "current_answer": null,
            "time_to_answer": null,
            "answered_question": null,
        }));
        self.store
            .update(Table::Players, Filter::eq("game_id", code), patch)
            .await
            .map(|_| ())
    }

    pub async fn delete_player(&self, id: &str) -> StorageResult<()> {
        self.store
            .delete(Table::Players, Filter::eq("id", id))
            .await
            .map(|_| ())
    }

    /// Insert the question bank of a session, one row per question.
    pub async fn insert_questions(&self, questions: &[QuestionRecord]) -> StorageResult<()> {
        for question in questions {
            self.store
                .insert(Table::GameQuestions, encode(Table::GameQuestions, question)?)
                .await?;
        }
        Ok(())
    }

    /// Questions of a session in play order.
    pub async fn list_questions(&self, code: &str) -> StorageResult<Vec<QuestionRecord>> {
        let rows = self
            .store
            .select(
                Table::GameQuestions,
                Filter::eq("game_id", code),
                Some(OrderBy::asc("question_index")),
            )
            .await?;
        decode_all(Table::GameQuestions, rows)
    }

    /// Tear a session down: questions, players, then the session record.
    ///
    /// Subscribers see the final `games` delete and drop their local copy.
    pub async fn delete_session(&self, code: &str) -> StorageResult<()> {
        self.store
            .delete(Table::GameQuestions, Filter::eq("game_id", code))
            .await?;
        self.store
            .delete(Table::Players, Filter::eq("game_id", code))
            .await?;
        self.store
            .delete(Table::Games, Filter::eq("id", code))
            .await?;
        Ok(())
    }

    /// Change feed of a single session record.
    pub async fn watch_game(&self, code: &str) -> StorageResult<BoxStream<'static, ChangeEvent>> {
        self.store
            .subscribe(Table::Games, Filter::eq("id", code))
            .await
    }

    /// Change feed of every player row of a session.
    pub async fn watch_players(
        &self,
        code: &str,
    ) -> StorageResult<BoxStream<'static, ChangeEvent>> {
        self.store
            .subscribe(Table::Players, Filter::eq("game_id", code))
            .await
    }
}

fn require_row(
    affected: usize,
    table: Table,
    target: impl FnOnce() -> String,
) -> StorageResult<()> {
    if affected == 0 {
        return Err(StorageError::Missing {
            table,
            target: target(),
        });
    }
    Ok(())
}

fn into_patch(value: Value) -> Patch {
    match value {
        Value::Object(columns) => columns,
        _ => Patch::new(),
    }
}

fn encode<T: Serialize>(table: Table, record: &T) -> StorageResult<Row> {
    serde_json::to_value(record).map_err(|source| StorageError::Malformed { table, source })
}

/// Decode a raw row into its typed record.
pub fn decode<T: DeserializeOwned>(table: Table, row: Row) -> StorageResult<T> {
    serde_json::from_value(row).map_err(|source| StorageError::Malformed { table, source })
}

fn decode_all<T: DeserializeOwned>(table: Table, rows: Vec<Row>) -> StorageResult<Vec<T>> {
    rows.into_iter().map(|row| decode(table, row)).collect()
}
