//! Conversions between stored rows and the session aggregate.
//!
//! Rebuilding a [`Session`] only depends on the last-known rows, so applying
//! the same change twice yields the same snapshot.

use indexmap::IndexMap;
use uuid::Uuid;

use crate::{
    dao::models::{GameRecord, PlayerRecord, QuestionRecord},
    state::{
        session::{Player, Question, Session},
        state_machine::SessionPhase,
    },
};

/// Phase encoded by a session record.
pub fn phase_of(game: &GameRecord) -> SessionPhase {
    let index = game.current_question_index;
    if !game.is_started {
        SessionPhase::Lobby
    } else if game.is_finished {
        SessionPhase::Finished
    } else if game.show_results {
        SessionPhase::Results { index }
    } else {
        SessionPhase::Question { index }
    }
}

/// Player id of the host: the recorded one, else the earliest player.
pub fn host_of(game: &GameRecord, players: &[PlayerRecord]) -> String {
    game.host_id
        .clone()
        .or_else(|| players.first().map(|player| player.id.clone()))
        .unwrap_or_default()
}

/// Rebuild the aggregate from the session record and the player list.
///
/// `time_remaining_seconds` is the allotted time of the current phase. Rows
/// carry no clock, so the live countdown comes from the turn coordinator.
pub fn reconcile(game: &GameRecord, players: &[PlayerRecord], questions: &[Question]) -> Session {
    let phase = phase_of(game);
    let time_remaining_seconds = match phase {
        SessionPhase::Question { index } => questions
            .get(index)
            .map(|question| question.time_limit_seconds)
            .unwrap_or_default(),
        SessionPhase::Lobby => questions
            .first()
            .map(|question| question.time_limit_seconds)
            .unwrap_or_default(),
        SessionPhase::Results { .. } | SessionPhase::Finished => 0,
    };

    Session {
        id: game.id.clone(),
        host_player_id: host_of(game, players),
        phase,
        current_question_index: game.current_question_index,
        questions: questions.to_vec(),
        time_remaining_seconds,
        players: players
            .iter()
            .map(|record| (record.id.clone(), player_from(record, game.current_question_index)))
            .collect::<IndexMap<_, _>>(),
    }
}

/// Whether `record` holds an answer to question `question`.
///
/// Rows written without `answered_question` count for whichever question is live.
pub fn has_answered(record: &PlayerRecord, question: usize) -> bool {
    record.current_answer.is_some()
        && record
            .answered_question
            .is_none_or(|answered| answered == question)
}

/// Aggregate view of a player row while question `question` is current.
///
/// An answer left over from another question reads as no answer.
pub fn player_from(record: &PlayerRecord, question: usize) -> Player {
    let answered = has_answered(record, question);
    Player {
        id: record.id.clone(),
        display_name: record.name.clone(),
        score: record.score,
        current_answer: record.current_answer.filter(|_| answered),
        // Latency is only meaningful next to an answer.
        answer_latency_seconds: answered.then(|| record.time_to_answer.unwrap_or_default()),
    }
}

/// Aggregate view of a stored question.
pub fn question_from(record: QuestionRecord) -> Question {
    let time_limit_seconds = record.time_limit_seconds();
    Question {
        id: record.id,
        prompt: record.question,
        options: record.options,
        correct_option_index: record.correct_answer,
        time_limit_seconds,
    }
}

/// Question rows of a new session, each with a fresh row id.
pub fn question_records(code: &str, questions: &[Question]) -> Vec<QuestionRecord> {
    questions
        .iter()
        .enumerate()
        .map(|(index, question)| QuestionRecord {
            id: Uuid::new_v4().to_string(),
            game_id: code.to_string(),
            question_index: index,
            question: question.prompt.clone(),
            options: question.options.clone(),
            correct_answer: question.correct_option_index,
            time_limit: Some(question.time_limit_seconds),
        })
        .collect()
}
