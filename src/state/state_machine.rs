use std::{fmt, time::Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Phases a session moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SessionPhase {
    /// Accepting joins; no question revealed yet.
    Lobby,
    /// A question is live and answers are accepted.
    Question {
        /// Index of the live question.
        index: usize,
    },
    /// Answers are frozen and the results of question `index` are shown.
    Results {
        /// Index of the question whose results are shown.
        index: usize,
    },
    /// Every question has been played. Terminal.
    Finished,
}

impl SessionPhase {
    /// Question index carried by the phase, if any.
    pub fn question_index(&self) -> Option<usize> {
        match self {
            SessionPhase::Question { index } | SessionPhase::Results { index } => Some(*index),
            SessionPhase::Lobby | SessionPhase::Finished => None,
        }
    }

    /// Whether answers are accepted in this phase.
    pub fn accepts_answers(&self) -> bool {
        matches!(self, SessionPhase::Question { .. })
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Lobby => f.write_str("lobby"),
            SessionPhase::Question { index } => write!(f, "question({index})"),
            SessionPhase::Results { index } => write!(f, "results({index})"),
            SessionPhase::Finished => f.write_str("finished"),
        }
    }
}

/// Why a live question was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Every player submitted an answer.
    AllAnswered,
    /// The countdown reached zero.
    Timeout,
    /// The host closed the question by hand.
    Manual,
}

/// Events that can be applied to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Host leaves the lobby with `players` participants present.
    StartSession {
        /// Number of players in the session, host included.
        players: usize,
    },
    /// Freeze answers on the live question.
    CloseQuestion(CloseReason),
    /// Move from the results of a question to the next one.
    NextQuestion,
    /// Leave the results of the last question for the final leaderboard.
    Finish,
}

/// Inclusive bounds on the number of players required to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerLimits {
    /// Fewest players, host included.
    pub min: usize,
    /// Most players, host included.
    pub max: usize,
}

impl Default for PlayerLimits {
    fn default() -> Self {
        Self { min: 2, max: 20 }
    }
}

impl PlayerLimits {
    /// Whether `count` players satisfy the bounds.
    pub fn contains(&self, count: usize) -> bool {
        (self.min..=self.max).contains(&count)
    }
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from}")]
pub struct InvalidTransition {
    /// The phase the state machine was in when the invalid event was received.
    pub from: SessionPhase,
    /// The event that cannot be applied from this phase.
    pub event: SessionEvent,
}

/// Errors that can occur when planning a state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A transition is already pending and must be applied or aborted.
    AlreadyPending,
    /// The requested transition is not valid from the current phase.
    InvalidTransition(InvalidTransition),
    /// The session cannot start with this many players.
    PlayerCount {
        /// Players present.
        count: usize,
        /// Bounds the count violates.
        limits: PlayerLimits,
    },
}

/// Errors that can occur when applying a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// No transition is currently pending.
    NoPending,
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
    /// State machine phase changed since the plan was created.
    PhaseMismatch {
        /// Phase when plan was created.
        expected: SessionPhase,
        /// Current phase.
        actual: SessionPhase,
    },
    /// State machine version changed since the plan was created.
    VersionMismatch {
        /// Version when plan was created.
        expected: usize,
        /// Current version.
        actual: usize,
    },
}

/// Errors that can occur when aborting a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortError {
    /// No transition is currently pending.
    NoPending,
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
}

/// Unique identifier for a planned state transition.
pub type PlanId = Uuid;

/// A planned state machine transition that has been validated but not yet applied.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Unique identifier for this plan.
    pub id: PlanId,
    /// Phase the state machine is currently in.
    pub from: SessionPhase,
    /// Phase the state machine will transition to.
    pub to: SessionPhase,
    /// Event that triggered this transition.
    pub event: SessionEvent,
    /// Version number after applying this transition.
    pub version_next: usize,
    /// Timestamp when this plan was created.
    pub pending_since: Instant,
}

/// Snapshot of the current state machine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Current phase of the state machine.
    pub phase: SessionPhase,
    /// Version number of the state machine (increments on each transition).
    pub version: usize,
    /// Pending transition phase, if a transition is planned but not yet applied.
    pub pending: Option<SessionPhase>,
}

/// State machine driving one session through its questions.
///
/// Transitions authored locally go through [`plan`](Self::plan) then
/// [`apply`](Self::apply) or [`abort`](Self::abort). Phases authored by
/// another client are taken in with [`observe`](Self::observe).
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    phase: SessionPhase,
    version: usize,
    pending: Option<Plan>,
    question_count: usize,
    limits: PlayerLimits,
}

impl SessionStateMachine {
    /// Create a machine in the lobby for a session of `question_count` questions.
    pub fn new(question_count: usize, limits: PlayerLimits) -> Self {
        Self {
            phase: SessionPhase::Lobby,
            version: 0,
            pending: None,
            question_count,
            limits,
        }
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Player bounds enforced when starting.
    pub fn limits(&self) -> PlayerLimits {
        self.limits
    }

    /// Create a snapshot of the current state machine state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase,
            version: self.version,
            pending: self.pending.as_ref().map(|plan| plan.to),
        }
    }

    /// Event that advances out of the current results phase, if there is one.
    pub fn advance_event(&self) -> Option<SessionEvent> {
        match self.phase {
            SessionPhase::Results { index } if index + 1 < self.question_count => {
                Some(SessionEvent::NextQuestion)
            }
            SessionPhase::Results { .. } => Some(SessionEvent::Finish),
            _ => None,
        }
    }

    /// Plan a transition by validating that the event can be applied from the current phase.
    /// Returns a Plan that can later be applied or aborted.
    pub fn plan(&mut self, event: SessionEvent) -> Result<Plan, PlanError> {
        if self.pending.is_some() {
            return Err(PlanError::AlreadyPending);
        }

        let next = self.compute_transition(event)?;

        let plan = Plan {
            id: Uuid::new_v4(),
            from: self.phase,
            to: next,
            event,
            version_next: self.version + 1,
            pending_since: Instant::now(),
        };

        self.pending = Some(plan.clone());

        Ok(plan)
    }

    /// Apply a planned transition, moving the state machine to the next phase.
    /// Returns the new phase after the transition.
    pub fn apply(&mut self, plan_id: PlanId) -> Result<SessionPhase, ApplyError> {
        let plan = self.pending.take().ok_or(ApplyError::NoPending)?;

        if plan.id != plan_id {
            let expected_plan_id = plan.id;
            self.pending = Some(plan);
            return Err(ApplyError::IdMismatch {
                expected: expected_plan_id,
                got: plan_id,
            });
        }

        if self.phase != plan.from {
            return Err(ApplyError::PhaseMismatch {
                expected: plan.from,
                actual: self.phase,
            });
        }

        if self.version + 1 != plan.version_next {
            return Err(ApplyError::VersionMismatch {
                expected: plan.version_next,
                actual: self.version + 1,
            });
        }

        self.phase = plan.to;
        self.version = plan.version_next;

        Ok(self.phase)
    }

    /// Abort a planned transition without applying it, returning the state
    /// machine to its previous state.
    pub fn abort(&mut self, plan_id: PlanId) -> Result<(), AbortError> {
        let plan = self.pending.as_ref().ok_or(AbortError::NoPending)?;

        if plan.id != plan_id {
            return Err(AbortError::IdMismatch {
                expected: plan.id,
                got: plan_id,
            });
        }

        self.pending = None;
        Ok(())
    }

    /// Take in a phase read back from the store.
    ///
    /// The echo of a pending plan's own write is left for [`apply`](Self::apply).
    /// Returns whether the phase changed.
    pub fn observe(&mut self, phase: SessionPhase) -> bool {
        if phase == self.phase {
            return false;
        }
        if self.pending.as_ref().is_some_and(|plan| plan.to == phase) {
            return false;
        }

        self.phase = phase;
        self.version += 1;
        true
    }

    /// Compute a transition from an event if the transition is valid.
    fn compute_transition(&self, event: SessionEvent) -> Result<SessionPhase, PlanError> {
        let invalid = || {
            PlanError::InvalidTransition(InvalidTransition {
                from: self.phase,
                event,
            })
        };

        let next = match (self.phase, event) {
            (SessionPhase::Lobby, SessionEvent::StartSession { players }) => {
                if self.question_count == 0 {
                    return Err(invalid());
                }
                if !self.limits.contains(players) {
                    return Err(PlanError::PlayerCount {
                        count: players,
                        limits: self.limits,
                    });
                }
                SessionPhase::Question { index: 0 }
            }
            (SessionPhase::Question { index }, SessionEvent::CloseQuestion(_)) => {
                SessionPhase::Results { index }
            }
            (SessionPhase::Results { index }, SessionEvent::NextQuestion)
                if index + 1 < self.question_count =>
            {
                SessionPhase::Question { index: index + 1 }
            }
            (SessionPhase::Results { index }, SessionEvent::Finish)
                if index + 1 >= self.question_count =>
            {
                SessionPhase::Finished
            }
            _ => return Err(invalid()),
        };

        Ok(next)
    }
}
