//! Synchronization layer: the contract every participant drives, and its two backends.

pub mod local_sync;
pub mod merge;
pub mod store_sync;

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use rand::{Rng, rng};
use tokio::sync::watch;

use crate::{
    config::{AppConfig, SyncMode},
    dao::session_store::SessionStore,
    error::{SyncError, SyncResult},
    state::{
        session::{AnswerOutcome, PlayerId, Question, Session, SessionCode},
        state_machine::{CloseReason, PlayerLimits, SessionPhase},
    },
};

pub use self::local_sync::{LocalHub, LocalSync};
pub use self::store_sync::StoreSync;

/// Length of a session code.
pub const SESSION_CODE_LEN: usize = 6;
/// Characters a session code is drawn from.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Codes tried before giving up on creating a session.
pub const MAX_CODE_ATTEMPTS: usize = 8;

/// Operations a participant performs on the session it belongs to.
///
/// Mutations validate local preconditions before touching shared state.
/// Host-only operations fail with [`SyncError::NotHost`] for everyone else.
pub trait SessionSync: Send + Sync {
    /// Create a session hosted by the local participant and return its code.
    fn create_session<'a>(&'a self, host_name: &'a str) -> BoxFuture<'a, SyncResult<SessionCode>>;

    /// Join the lobby of session `code`.
    fn join_session<'a>(
        &'a self,
        code: &'a str,
        player_name: &'a str,
    ) -> BoxFuture<'a, SyncResult<()>>;

    /// Leave the lobby for the first question. Host only.
    fn start_session(&self) -> BoxFuture<'_, SyncResult<SessionPhase>>;

    /// Answer the live question `elapsed_seconds` after it was revealed.
    ///
    /// A second answer to the same question is ignored.
    fn submit_answer(
        &self,
        answer_index: usize,
        elapsed_seconds: f64,
    ) -> BoxFuture<'_, SyncResult<AnswerOutcome>>;

    /// Close the live question. Host only.
    ///
    /// Returns `false` when no question is live, so racing callers are harmless.
    fn reveal_results(&self, reason: CloseReason) -> BoxFuture<'_, SyncResult<bool>>;

    /// Leave the results for the next question or the final leaderboard. Host only.
    fn advance_phase(&self) -> BoxFuture<'_, SyncResult<SessionPhase>>;

    /// Leave the session. When the host leaves, the session is torn down for everyone.
    fn leave(&self) -> BoxFuture<'_, SyncResult<()>>;

    /// Feed of reconciled snapshots; `None` while detached.
    fn subscribe(&self) -> watch::Receiver<Option<Session>>;

    /// Latest reconciled snapshot.
    fn snapshot(&self) -> Option<Session>;

    /// Id of the local participant once attached.
    fn local_player_id(&self) -> Option<PlayerId>;

    /// Whether the local participant hosts the attached session.
    fn is_host(&self) -> bool;
}

/// Rules every participant of a deployment shares.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Player bounds enforced on join and start.
    pub limits: PlayerLimits,
    /// Question bank copied into every new session.
    pub questions: Vec<Question>,
    /// Upper bound on the store work of a phase transition.
    pub transition_timeout: Option<Duration>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl SyncSettings {
    /// Settings taken from the application configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            limits: config.limits,
            questions: config.questions.clone(),
            transition_timeout: Some(config.transition_timeout),
        }
    }
}

/// Backend participants are created against.
#[derive(Clone)]
pub enum SyncBackend {
    /// Every participant lives in this process.
    Local(Arc<LocalHub>),
    /// Participants meet through a session store.
    Store(Arc<dyn SessionStore>),
}

impl SyncBackend {
    /// Backend selected by [`AppConfig::sync_mode`].
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        match config.sync_mode {
            SyncMode::Local => Ok(Self::Local(Arc::new(LocalHub::new()))),
            SyncMode::Store => Self::store_from_config(config),
        }
    }

    #[cfg(feature = "http-store")]
    fn store_from_config(config: &AppConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        use crate::dao::session_store::http::{HttpSessionStore, HttpStoreConfig};

        let store_config = match &config.store_url {
            Some(url) => HttpStoreConfig::new(url.clone()),
            None => HttpStoreConfig::from_env().context("resolving the store server address")?,
        };
        let store = HttpSessionStore::new(store_config).context("building the store client")?;
        Ok(Self::Store(Arc::new(store)))
    }

    #[cfg(not(feature = "http-store"))]
    fn store_from_config(_config: &AppConfig) -> anyhow::Result<Self> {
        anyhow::bail!("store mode requires the `http-store` feature")
    }

    /// A fresh, detached participant.
    pub fn participant(&self, settings: SyncSettings) -> Arc<dyn SessionSync> {
        match self {
            SyncBackend::Local(hub) => Arc::new(LocalSync::new(hub.clone(), settings)),
            SyncBackend::Store(store) => Arc::new(StoreSync::new(store.clone(), settings)),
        }
    }
}

/// Random session code.
pub fn generate_code() -> SessionCode {
    let mut rng = rng();
    (0..SESSION_CODE_LEN)
        .map(|_| char::from(CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())]))
        .collect()
}

/// Trim and uppercase a typed code, rejecting anything that cannot be a session code.
pub fn normalize_code(code: &str) -> SyncResult<SessionCode> {
    let code = code.trim().to_ascii_uppercase();
    let well_formed =
        code.len() == SESSION_CODE_LEN && code.bytes().all(|b| CODE_ALPHABET.contains(&b));
    if well_formed {
        Ok(code)
    } else {
        Err(SyncError::InvalidInput(format!("malformed session code `{code}`")))
    }
}

/// Trimmed display name, rejecting blank ones.
pub fn normalize_name(name: &str) -> SyncResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SyncError::InvalidInput("name must not be empty".into()));
    }
    Ok(name.to_string())
}
