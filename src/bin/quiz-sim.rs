//! Plays one full session with bot participants against the configured backend.
//!
//! Usage: `quiz-sim [BOTS]` (default 3). The backend, player bounds, timings and
//! question bank come from the application configuration.

use std::{env, sync::Arc, time::Duration};

use anyhow::Context;
use rand::{Rng, rng};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quiz_arena::{
    config::AppConfig,
    services::{
        coordinator,
        sync::{SessionSync, SyncBackend, SyncSettings},
    },
    state::state_machine::SessionPhase,
};

const RESULTS_PAUSE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let bots = env::args()
        .nth(1)
        .map(|value| value.parse::<usize>())
        .transpose()
        .context("BOTS must be a number")?
        .unwrap_or(3);

    let config = AppConfig::load();
    let backend = SyncBackend::from_config(&config)?;
    let settings = SyncSettings::from_config(&config);

    let host = backend.participant(settings.clone());
    let code = host.create_session("Host").await?;
    info!(session = %code, bots, "session created");

    let mut players: Vec<Arc<dyn SessionSync>> = vec![host.clone()];
    for n in 1..=bots {
        let bot = backend.participant(settings.clone());
        bot.join_session(&code, &format!("Bot {n}")).await?;
        players.push(bot);
    }

    let mut turns = coordinator::spawn(host.clone(), config.grace_delay)?;
    host.start_session().await?;
    let mut feed = host.subscribe();

    loop {
        let Some(session) = host.snapshot() else {
            warn!(session = %code, "session disappeared");
            break;
        };

        match session.phase {
            SessionPhase::Lobby => {
                feed.changed().await?;
            }
            SessionPhase::Question { index } => {
                let Some(question) = session.questions.get(index) else {
                    break;
                };
                info!(question = index, prompt = %question.prompt, "question live");
                for player in &players {
                    let (answer, elapsed) = {
                        let mut rng = rng();
                        let limit = f64::from(question.time_limit_seconds);
                        (
                            rng.random_range(0..question.options.len()),
                            rng.random_range(0.0..limit * 0.8),
                        )
                    };
                    let player = player.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs_f64(elapsed)).await;
                        if let Err(err) = player.submit_answer(answer, elapsed).await {
                            warn!(error = %err, "bot failed to answer");
                        }
                    });
                }
                feed.wait_for(|snapshot| {
                    snapshot.as_ref().map(|session| session.phase)
                        != Some(SessionPhase::Question { index })
                })
                .await?;
            }
            SessionPhase::Results { index } => {
                info!(
                    question = index,
                    distribution = ?session.answer_distribution(),
                    "results"
                );
                while let Ok(err) = turns.errors().try_recv() {
                    warn!(error = %err, "coordinator error");
                }
                tokio::time::sleep(RESULTS_PAUSE).await;
                host.advance_phase().await?;
            }
            SessionPhase::Finished => {
                println!("Final leaderboard for {code}:");
                for (rank, player) in session.leaderboard().iter().enumerate() {
                    println!("{:>3}. {:<12} {:>6}", rank + 1, player.display_name, player.score);
                }
                break;
            }
        }
    }

    turns.shutdown();
    host.leave().await?;
    Ok(())
}

fn init_tracing() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
