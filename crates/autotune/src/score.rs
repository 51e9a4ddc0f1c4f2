//! Scores reported back to the search loop.
//!
//! A score is either a measured latency (lower is better) or one of four
//! sentinels. Sentinels are large constants, so a plain numeric minimum over
//! scores always prefers any real measurement.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a configuration produced no usable measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Failure {
    RunFailed,
    PrecisionError,
    CompileFailed,
    Timeout,
}

impl Failure {
    pub const ALL: [Failure; 4] = [
        Failure::RunFailed,
        Failure::PrecisionError,
        Failure::CompileFailed,
        Failure::Timeout,
    ];

    pub fn score(self) -> Score {
        match self {
            Failure::RunFailed => Score::RUN_FAILED,
            Failure::PrecisionError => Score::PRECISION_ERROR,
            Failure::CompileFailed => Score::COMPILE_FAILED,
            Failure::Timeout => Score::TIMEOUT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Failure::RunFailed => "run_failed",
            Failure::PrecisionError => "precision_error",
            Failure::CompileFailed => "compile_failed",
            Failure::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score(f64);

impl Score {
    pub const RUN_FAILED: Score = Score(9_999_999_999.0);
    pub const PRECISION_ERROR: Score = Score(9_999_999_998.0);
    pub const COMPILE_FAILED: Score = Score(9_999_999_997.0);
    pub const TIMEOUT: Score = Score(9_999_999_996.0);

    /// Wrap a launcher timing. Negative or non-finite timings cannot be
    /// ranked and are reported as run failures.
    pub fn measured(run_time: f64) -> Score {
        if run_time.is_finite() && run_time >= 0.0 {
            Score(run_time)
        } else {
            Score::RUN_FAILED
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn failure(self) -> Option<Failure> {
        Failure::ALL.into_iter().find(|f| f.score().0 == self.0)
    }

    pub fn is_failure(self) -> bool {
        self.failure().is_some()
    }

    /// Numeric minimum; sentinels compete with each other by value too.
    pub fn min(self, other: Score) -> Score {
        if other.0 < self.0 {
            other
        } else {
            self
        }
    }

    pub fn to_bits(self) -> u64 {
        self.0.to_bits()
    }

    pub fn from_bits(bits: u64) -> Score {
        Score(f64::from_bits(bits))
    }
}

impl From<Failure> for Score {
    fn from(failure: Failure) -> Self {
        failure.score()
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failure() {
            Some(failure) => failure.fmt(f),
            None => write!(f, "{}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_ordered_and_worse_than_real_times() {
        assert!(Score::RUN_FAILED > Score::PRECISION_ERROR);
        assert!(Score::PRECISION_ERROR > Score::COMPILE_FAILED);
        assert!(Score::COMPILE_FAILED > Score::TIMEOUT);
        assert!(Score::TIMEOUT > Score::measured(1.0e9));
    }

    #[test]
    fn min_prefers_real_measurement() {
        let real = Score::measured(12.3);
        assert_eq!(Score::RUN_FAILED.min(real), real);
        assert_eq!(real.min(Score::PRECISION_ERROR), real);
    }

    #[test]
    fn min_between_sentinels_is_numeric() {
        assert_eq!(
            Score::RUN_FAILED.min(Score::PRECISION_ERROR),
            Score::PRECISION_ERROR
        );
    }

    #[test]
    fn failure_round_trips_through_score() {
        for failure in Failure::ALL {
            assert_eq!(failure.score().failure(), Some(failure));
        }
        assert_eq!(Score::measured(3.5).failure(), None);
    }

    #[test]
    fn invalid_timings_become_run_failures() {
        assert_eq!(Score::measured(f64::NAN), Score::RUN_FAILED);
        assert_eq!(Score::measured(-1.0), Score::RUN_FAILED);
        assert_eq!(Score::measured(f64::INFINITY), Score::RUN_FAILED);
    }

    #[test]
    fn display_names_sentinels() {
        assert_eq!(Score::TIMEOUT.to_string(), "timeout");
        assert_eq!(Score::COMPILE_FAILED.to_string(), "compile_failed");
        assert_eq!(Score::measured(2.5).to_string(), "2.5");
    }

    #[test]
    fn bits_round_trip() {
        let score = Score::measured(0.125);
        assert_eq!(Score::from_bits(score.to_bits()), score);
    }
}
