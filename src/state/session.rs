use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    services::scoring,
    state::state_machine::{PlayerLimits, SessionPhase},
};

/// Opaque player identifier (UUID v4 string).
pub type PlayerId = String;

/// Six character session code.
pub type SessionCode = String;

/// Immutable multiple-choice question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Question id.
    pub id: String,
    /// Text shown to every player.
    pub prompt: String,
    /// Options in display order.
    pub options: Vec<String>,
    /// Index of the correct option.
    pub correct_option_index: usize,
    /// Seconds allowed to answer.
    pub time_limit_seconds: u32,
}

/// A participant, the host included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    /// Player id, unique across sessions.
    pub id: PlayerId,
    /// Name shown on the leaderboard.
    pub display_name: String,
    /// Cumulative score.
    pub score: u32,
    /// Option picked for the live question.
    pub current_answer: Option<usize>,
    /// Seconds between reveal and submission; set together with `current_answer`.
    pub answer_latency_seconds: Option<f64>,
}

impl Player {
    /// New player with no points and no answer.
    pub fn new(id: PlayerId, display_name: String) -> Self {
        Self {
            id,
            display_name,
            score: 0,
            current_answer: None,
            answer_latency_seconds: None,
        }
    }

    /// Whether the player answered the live question.
    pub fn has_answered(&self) -> bool {
        self.current_answer.is_some()
    }
}

/// Errors raised by the session aggregate itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// No player with this id belongs to the session.
    #[error("unknown player `{0}`")]
    UnknownPlayer(PlayerId),
    /// The session is not on a live question.
    #[error("answers are not accepted while in {0}")]
    NotAcceptingAnswers(SessionPhase),
    /// The option does not exist on the live question.
    #[error("answer {index} is out of range for {options} options")]
    AnswerOutOfRange {
        /// Submitted option.
        index: usize,
        /// Options on the question.
        options: usize,
    },
    /// Latency is negative or not a number.
    #[error("invalid answer latency {0}")]
    InvalidLatency(f64),
}

/// Result of submitting an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// The answer was recorded and scored.
    Recorded {
        /// Points earned on this question.
        points: u32,
        /// Cumulative score including the points.
        score: u32,
    },
    /// The player had already answered; nothing changed.
    AlreadyAnswered,
}

/// An answer that passed validation, ready to be recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckedAnswer {
    /// Chosen option.
    pub index: usize,
    /// Latency clamped to the question's time limit.
    pub latency_seconds: f64,
    /// Points the answer earns.
    pub points: u32,
}

/// Root aggregate of one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session code.
    pub id: SessionCode,
    /// Player allowed to start and advance the session.
    pub host_player_id: PlayerId,
    /// Current phase.
    pub phase: SessionPhase,
    /// Index of the live (or last) question.
    pub current_question_index: usize,
    /// Question bank, fixed at creation.
    pub questions: Vec<Question>,
    /// Seconds allotted to the current question, zero once its results show.
    /// The value does not tick; the live countdown is the turn coordinator's
    /// `CoordinatorHandle::remaining`.
    pub time_remaining_seconds: u32,
    /// Players in join order.
    pub players: IndexMap<PlayerId, Player>,
}

impl Session {
    /// New lobby with `host` as its first player.
    pub fn new(id: SessionCode, host: Player, questions: Vec<Question>) -> Self {
        let time_remaining_seconds = questions
            .first()
            .map(|question| question.time_limit_seconds)
            .unwrap_or_default();
        let mut players = IndexMap::new();
        let host_player_id = host.id.clone();
        players.insert(host.id.clone(), host);

        Self {
            id,
            host_player_id,
            phase: SessionPhase::Lobby,
            current_question_index: 0,
            questions,
            time_remaining_seconds,
            players,
        }
    }

    /// Question being played or reviewed.
    pub fn current_question(&self) -> Option<&Question> {
        self.phase
            .question_index()
            .and_then(|index| self.questions.get(index))
    }

    /// Whether `player_id` is the host.
    pub fn is_host(&self, player_id: &str) -> bool {
        self.host_player_id == player_id
    }

    /// Whether every player answered the live question.
    pub fn all_answered(&self) -> bool {
        self.phase.accepts_answers()
            && !self.players.is_empty()
            && self.players.values().all(Player::has_answered)
    }

    /// Whether the host may start with the players present.
    pub fn can_start(&self, limits: PlayerLimits) -> bool {
        self.phase == SessionPhase::Lobby && limits.contains(self.players.len())
    }

    /// Add a player at the end of the join order.
    pub fn add_player(&mut self, player: Player) {
        self.players.insert(player.id.clone(), player);
    }

    /// Validate an answer from `player_id` and compute its points.
    ///
    /// Latency above the time limit is clamped down to it. Returns `None`
    /// when the player already answered the live question.
    pub fn check_answer(
        &self,
        player_id: &str,
        index: usize,
        latency_seconds: f64,
    ) -> Result<Option<CheckedAnswer>, SessionError> {
        let player = self
            .players
            .get(player_id)
            .ok_or_else(|| SessionError::UnknownPlayer(player_id.to_string()))?;
        let question = match self.current_question() {
            Some(question) if self.phase.accepts_answers() => question,
            _ => return Err(SessionError::NotAcceptingAnswers(self.phase)),
        };
        if index >= question.options.len() {
            return Err(SessionError::AnswerOutOfRange {
                index,
                options: question.options.len(),
            });
        }
        if !latency_seconds.is_finite() || latency_seconds < 0.0 {
            return Err(SessionError::InvalidLatency(latency_seconds));
        }
        if player.has_answered() {
            return Ok(None);
        }

        let latency_seconds = latency_seconds.min(f64::from(question.time_limit_seconds));
        Ok(Some(CheckedAnswer {
            index,
            latency_seconds,
            points: scoring::score(question, Some(index), latency_seconds),
        }))
    }

    /// Validate and record an answer in place.
    pub fn record_answer(
        &mut self,
        player_id: &str,
        index: usize,
        latency_seconds: f64,
    ) -> Result<AnswerOutcome, SessionError> {
        let Some(answer) = self.check_answer(player_id, index, latency_seconds)? else {
            return Ok(AnswerOutcome::AlreadyAnswered);
        };
        let player = self
            .players
            .get_mut(player_id)
            .ok_or_else(|| SessionError::UnknownPlayer(player_id.to_string()))?;

        player.current_answer = Some(answer.index);
        player.answer_latency_seconds = Some(answer.latency_seconds);
        player.score = player.score.saturating_add(answer.points);

        Ok(AnswerOutcome::Recorded {
            points: answer.points,
            score: player.score,
        })
    }

    /// Move the aggregate into `phase`.
    ///
    /// Entering a question clears every answer and resets the remaining time.
    pub fn enter_phase(&mut self, phase: SessionPhase) {
        self.phase = phase;
        match phase {
            SessionPhase::Question { index } => {
                self.current_question_index = index;
                for player in self.players.values_mut() {
                    player.current_answer = None;
                    player.answer_latency_seconds = None;
                }
                self.time_remaining_seconds = self
                    .questions
                    .get(index)
                    .map(|question| question.time_limit_seconds)
                    .unwrap_or_default();
            }
            SessionPhase::Results { index } => {
                self.current_question_index = index;
                self.time_remaining_seconds = 0;
            }
            SessionPhase::Lobby | SessionPhase::Finished => {}
        }
    }

    /// Players by descending score; ties keep join order.
    pub fn leaderboard(&self) -> Vec<&Player> {
        let mut ranked: Vec<&Player> = self.players.values().collect();
        ranked.sort_by(|left, right| right.score.cmp(&left.score));
        ranked
    }

    /// Number of players who picked each option of the current question.
    pub fn answer_distribution(&self) -> Vec<usize> {
        let Some(question) = self.current_question() else {
            return Vec::new();
        };
        let mut counts = vec![0; question.options.len()];
        for answer in self.players.values().filter_map(|player| player.current_answer) {
            if let Some(count) = counts.get_mut(answer) {
                *count += 1;
            }
        }
        counts
    }

    /// Points `player_id` earned on the current question.
    pub fn points_for(&self, player_id: &str) -> u32 {
        match (self.current_question(), self.players.get(player_id)) {
            (Some(question), Some(player)) => scoring::score(
                question,
                player.current_answer,
                player.answer_latency_seconds.unwrap_or_default(),
            ),
            _ => 0,
        }
    }
}
