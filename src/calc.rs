use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// How a student's mastery score is derived from their attempt history.
/// Attempt scores are always ordered by occurrence (ties by attempt id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MasteryCalculation {
    Average,
    DecayingAverage,
    Highest,
    HighLastAverage,
    Mode,
}

impl MasteryCalculation {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "AVERAGE" => Some(Self::Average),
            "DECAYING_AVERAGE" => Some(Self::DecayingAverage),
            "HIGHEST" => Some(Self::Highest),
            "HIGH_LAST_AVERAGE" => Some(Self::HighLastAverage),
            "MODE" => Some(Self::Mode),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Average => "AVERAGE",
            Self::DecayingAverage => "DECAYING_AVERAGE",
            Self::Highest => "HIGHEST",
            Self::HighLastAverage => "HIGH_LAST_AVERAGE",
            Self::Mode => "MODE",
        }
    }
}

/// New teachers start with Canvas's own default method and a cutoff of 3.
pub const DEFAULT_CALCULATION: MasteryCalculation = MasteryCalculation::DecayingAverage;
pub const DEFAULT_MASTERY_SCORE: f64 = 3.0;

/// 1-decimal half-up rounding: `floor(10x + 0.5) / 10`.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

pub fn average(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    Some(round_off_1_decimal(
        scores.iter().sum::<f64>() / scores.len() as f64,
    ))
}

/// 35% of the mean of all prior attempts, 65% of the most recent one.
/// A single attempt stands on its own.
pub fn decaying_average(scores: &[f64]) -> Option<f64> {
    let (&last, rest) = scores.split_last()?;
    if rest.is_empty() {
        return Some(last);
    }
    let prior = rest.iter().sum::<f64>() / rest.len() as f64;
    Some(round_off_1_decimal(0.35 * prior + 0.65 * last))
}

pub fn highest(scores: &[f64]) -> Option<f64> {
    scores.iter().copied().reduce(f64::max)
}

pub fn high_last_average(scores: &[f64]) -> Option<f64> {
    let (&last, _) = scores.split_last()?;
    let max = highest(scores)?;
    Some(round_off_1_decimal((max + last) / 2.0))
}

/// Most frequent score; ties go to the score seen earliest.
pub fn mode(scores: &[f64]) -> Option<f64> {
    let mut counts: Vec<(f64, usize)> = Vec::new();
    for &s in scores {
        match counts.iter_mut().find(|(v, _)| *v == s) {
            Some(entry) => entry.1 += 1,
            None => counts.push((s, 1)),
        }
    }
    let mut best: Option<(f64, usize)> = None;
    for &(v, c) in &counts {
        if best.map(|(_, bc)| c > bc).unwrap_or(true) {
            best = Some((v, c));
        }
    }
    best.map(|(v, _)| v)
}

pub fn mastery_score(method: MasteryCalculation, scores: &[f64]) -> Option<f64> {
    match method {
        MasteryCalculation::Average => average(scores),
        MasteryCalculation::DecayingAverage => decaying_average(scores),
        MasteryCalculation::Highest => highest(scores),
        MasteryCalculation::HighLastAverage => high_last_average(scores),
        MasteryCalculation::Mode => mode(scores),
    }
}

/// The passback decision: meeting the cutoff earns full points, missing it
/// earns zero.
pub fn passback_grade(score: f64, cutoff: f64, points_possible: f64) -> f64 {
    if score >= cutoff {
        points_possible
    } else {
        0.0
    }
}

/// A student's attempt scores for one outcome, in the order the work
/// happened.
pub fn attempt_scores(
    conn: &Connection,
    outcome_canvas_id: i64,
    user_canvas_id: i64,
) -> rusqlite::Result<Vec<f64>> {
    let mut stmt = conn.prepare(
        "SELECT score FROM outcome_attempts
         WHERE outcome_canvas_id = ? AND user_canvas_id = ?
         ORDER BY occurred, attempt_canvas_id",
    )?;
    let scores = stmt
        .query_map((outcome_canvas_id, user_canvas_id), |r| r.get::<_, f64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(scores)
}

pub fn user_outcome_score(
    conn: &Connection,
    outcome_canvas_id: i64,
    user_canvas_id: i64,
    method: MasteryCalculation,
) -> rusqlite::Result<Option<f64>> {
    let scores = attempt_scores(conn, outcome_canvas_id, user_canvas_id)?;
    Ok(mastery_score(method, &scores))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_off_half_goes_up() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(3.55), 3.6);
        assert_eq!(round_off_1_decimal(2.25), 2.3);
    }

    #[test]
    fn average_rounds_to_one_decimal() {
        assert_eq!(average(&[3.0, 4.0, 3.0]), Some(3.3));
        assert_eq!(average(&[2.0]), Some(2.0));
        assert_eq!(average(&[]), None);
    }

    #[test]
    fn decaying_average_weights_latest() {
        // 0.35 * mean([2, 3]) + 0.65 * 4 = 0.875 + 2.6 = 3.475 -> 3.5
        assert_eq!(decaying_average(&[2.0, 3.0, 4.0]), Some(3.5));
        assert_eq!(decaying_average(&[3.0]), Some(3.0));
        assert_eq!(decaying_average(&[]), None);
    }

    #[test]
    fn highest_is_unrounded() {
        assert_eq!(highest(&[1.0, 3.75, 2.0]), Some(3.75));
        assert_eq!(highest(&[]), None);
    }

    #[test]
    fn high_last_average_means_max_and_latest() {
        // (4 + 1) / 2 = 2.5
        assert_eq!(high_last_average(&[4.0, 2.0, 1.0]), Some(2.5));
        // (4 + 3) / 2 = 3.5
        assert_eq!(high_last_average(&[4.0, 2.0, 3.0]), Some(3.5));
        assert_eq!(high_last_average(&[]), None);
    }

    #[test]
    fn mode_prefers_most_frequent_then_earliest() {
        assert_eq!(mode(&[3.0, 2.0, 3.0, 4.0]), Some(3.0));
        // 2 and 3 both appear twice; 2 was seen first.
        assert_eq!(mode(&[2.0, 3.0, 3.0, 2.0]), Some(2.0));
        assert_eq!(mode(&[]), None);
    }

    #[test]
    fn passback_cutoff_is_inclusive() {
        assert_eq!(passback_grade(3.0, 3.0, 10.0), 10.0);
        assert_eq!(passback_grade(3.4, 3.0, 10.0), 10.0);
        assert_eq!(passback_grade(2.9, 3.0, 10.0), 0.0);
    }

    #[test]
    fn calculation_names_round_trip() {
        for m in [
            MasteryCalculation::Average,
            MasteryCalculation::DecayingAverage,
            MasteryCalculation::Highest,
            MasteryCalculation::HighLastAverage,
            MasteryCalculation::Mode,
        ] {
            assert_eq!(MasteryCalculation::from_name(m.name()), Some(m));
        }
        assert_eq!(MasteryCalculation::from_name("MEDIAN"), None);
    }
}
