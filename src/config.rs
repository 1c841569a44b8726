//! Application-level configuration loading: sync backend, player bounds,
//! timings and the question bank.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::DurationMilliSeconds;
use tracing::{info, warn};
use validator::{Validate, ValidationError};

use crate::{
    dao::models::DEFAULT_TIME_LIMIT_SECONDS,
    state::{session::Question, state_machine::PlayerLimits},
};

/// Default location on disk where the configuration is looked up.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "QUIZ_ARENA_CONFIG_PATH";
/// Delay between the last answer and the results reveal.
const DEFAULT_GRACE_DELAY: Duration = Duration::from_millis(1000);

/// How participants share session state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Every participant lives in this process.
    #[default]
    Local,
    /// Participants meet through a session store server.
    Store,
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Synchronization backend.
    pub sync_mode: SyncMode,
    /// Base URL of the store server, used in [`SyncMode::Store`].
    pub store_url: Option<String>,
    /// Player bounds enforced when starting.
    pub limits: PlayerLimits,
    /// Delay between the last answer and the results reveal.
    pub grace_delay: Duration,
    /// Upper bound on the store work of a phase transition.
    pub transition_timeout: Duration,
    /// Question bank copied into every new session.
    pub questions: Vec<Question>,
}

impl AppConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        sync_mode = ?app_config.sync_mode,
                        questions = app_config.questions.len(),
                        "loaded configuration"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::default(),
            store_url: None,
            limits: PlayerLimits::default(),
            grace_delay: DEFAULT_GRACE_DELAY,
            transition_timeout: crate::state::DEFAULT_TRANSITION_TIMEOUT,
            questions: default_questions(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    #[serde(default)]
    sync_mode: SyncMode,
    #[serde(default)]
    store_url: Option<String>,
    #[serde(default)]
    min_players: Option<usize>,
    #[serde(default)]
    max_players: Option<usize>,
    #[serde(default, with = "serde_with::As::<Option<DurationMilliSeconds<u64>>>")]
    grace_delay_ms: Option<Duration>,
    #[serde(default, with = "serde_with::As::<Option<DurationMilliSeconds<u64>>>")]
    transition_timeout_ms: Option<Duration>,
    #[serde(default)]
    questions: Option<Vec<RawQuestion>>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let defaults = Self::default();

        let limits = PlayerLimits {
            min: value.min_players.unwrap_or(defaults.limits.min),
            max: value.max_players.unwrap_or(defaults.limits.max),
        };
        let limits = if limits.min == 0 || limits.min > limits.max {
            warn!(
                min = limits.min,
                max = limits.max,
                "invalid player bounds; using defaults"
            );
            defaults.limits
        } else {
            limits
        };

        let questions = match value.questions {
            Some(raw) => match validate_questions(&raw) {
                Ok(()) => raw.into_iter().enumerate().map(RawQuestion::into_question).collect(),
                Err(err) => {
                    warn!(error = %err, "invalid question bank; using built-in questions");
                    defaults.questions
                }
            },
            None => defaults.questions,
        };

        Self {
            sync_mode: value.sync_mode,
            store_url: value.store_url.filter(|url| !url.trim().is_empty()),
            limits,
            grace_delay: value.grace_delay_ms.unwrap_or(defaults.grace_delay),
            transition_timeout: value
                .transition_timeout_ms
                .unwrap_or(defaults.transition_timeout),
            questions,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_correct_option"))]
/// JSON representation of a question of the configured bank.
struct RawQuestion {
    #[serde(default)]
    id: Option<String>,
    #[validate(length(min = 1))]
    prompt: String,
    #[validate(length(min = 2))]
    options: Vec<String>,
    correct_option_index: usize,
    #[serde(default = "default_time_limit")]
    #[validate(range(min = 1))]
    time_limit_seconds: u32,
}

impl RawQuestion {
    fn into_question(position: (usize, RawQuestion)) -> Question {
        let (index, raw) = position;
        Question {
            id: raw.id.unwrap_or_else(|| (index + 1).to_string()),
            prompt: raw.prompt,
            options: raw.options,
            correct_option_index: raw.correct_option_index,
            time_limit_seconds: raw.time_limit_seconds,
        }
    }
}

fn default_time_limit() -> u32 {
    DEFAULT_TIME_LIMIT_SECONDS
}

fn validate_correct_option(question: &RawQuestion) -> Result<(), ValidationError> {
    if question.correct_option_index < question.options.len() {
        return Ok(());
    }
    let mut err = ValidationError::new("correct_option_index_range");
    err.message = Some(
        format!(
            "correct option {} is out of range for {} options",
            question.correct_option_index,
            question.options.len()
        )
        .into(),
    );
    Err(err)
}

fn validate_questions(questions: &[RawQuestion]) -> Result<(), String> {
    if questions.is_empty() {
        return Err("the question bank is empty".into());
    }
    for (index, question) in questions.iter().enumerate() {
        question
            .validate()
            .map_err(|err| format!("question {index}: {err}"))?;
    }
    Ok(())
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Built-in sample bank shipped with the binary.
pub fn default_questions() -> Vec<Question> {
    let question = |id: &str, prompt: &str, options: [&str; 4], correct, limit| Question {
        id: id.into(),
        prompt: prompt.into(),
        options: options.map(String::from).to_vec(),
        correct_option_index: correct,
        time_limit_seconds: limit,
    };

    vec![
        question(
            "1",
            "What is the capital of France?",
            ["London", "Berlin", "Paris", "Madrid"],
            2,
            15,
        ),
        question(
            "2",
            "Which planet is known as the Red Planet?",
            ["Venus", "Mars", "Jupiter", "Saturn"],
            1,
            15,
        ),
        question("3", "What is 7 × 8?", ["54", "56", "48", "64"], 1, 10),
        question(
            "4",
            "Who painted the Mona Lisa?",
            ["Van Gogh", "Picasso", "Da Vinci", "Monet"],
            2,
            15,
        ),
        question(
            "5",
            "What is the largest ocean on Earth?",
            ["Atlantic", "Indian", "Arctic", "Pacific"],
            3,
            12,
        ),
    ]
}
