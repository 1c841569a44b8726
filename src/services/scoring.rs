//! Points awarded for an answer.
//!
//! Every client and the host compute points with [`score`], so the points a
//! player sees always match the delta written to the store.

use crate::state::session::Question;

/// Points for any correct answer.
pub const BASE_POINTS: u32 = 1000;
/// Largest speed bonus, earned by answering instantly.
pub const MAX_SPEED_BONUS: u32 = 500;

/// Points earned by `answer` on `question` after `latency_seconds`.
///
/// Wrong and missing answers score 0; correct answers score between
/// [`BASE_POINTS`] and `BASE_POINTS + MAX_SPEED_BONUS`.
pub fn score(question: &Question, answer: Option<usize>, latency_seconds: f64) -> u32 {
    match answer {
        Some(index) if index == question.correct_option_index => {
            BASE_POINTS + speed_bonus(question.time_limit_seconds, latency_seconds)
        }
        _ => 0,
    }
}

/// Bonus proportional to the time left: `round(max(0, (limit - latency) / limit) * 500)`.
pub fn speed_bonus(time_limit_seconds: u32, latency_seconds: f64) -> u32 {
    if time_limit_seconds == 0 || !latency_seconds.is_finite() {
        return 0;
    }

    let limit = f64::from(time_limit_seconds);
    let ratio = ((limit - latency_seconds) / limit).max(0.0);
    let bonus = (ratio * f64::from(MAX_SPEED_BONUS)).round();
    bonus.clamp(0.0, f64::from(MAX_SPEED_BONUS)) as u32
}
