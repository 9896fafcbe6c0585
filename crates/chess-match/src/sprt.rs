//! Sequential probability ratio test over match results.
//!
//! The test compares H0 (the first engine is `elo0` stronger) against H1 (it
//! is `elo1` stronger). After every completed game the log-likelihood ratio
//! is recomputed from the match totals and compared against bounds derived
//! from the error rates `alpha` and `beta`. Once a bound is crossed the
//! verdict is final for the rest of the run.

use crate::config::SprtConfig;

/// Probabilities are floored to this before taking logarithms.
const MIN_PROBABILITY: f64 = 1e-9;

/// Expected score of a player `elo` points stronger than its opponent.
pub fn elo_to_score(elo: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf(-elo / 400.0))
}

/// Log-likelihood ratio of H1 over H0 for the given results.
///
/// The draw probability is estimated from the data and taken to be the same
/// under both hypotheses, so only the win and loss terms contribute.
/// Returns 0 when no games have been played.
pub fn log_likelihood_ratio(elo0: f64, elo1: f64, wins: u32, losses: u32, draws: u32) -> f64 {
    let n = wins + losses + draws;
    if n == 0 {
        return 0.0;
    }
    let draw_rate = f64::from(draws) / f64::from(n);
    let win_loss = |elo: f64| {
        let expected = elo_to_score(elo);
        let floor = |p: f64| if p <= 0.0 { MIN_PROBABILITY } else { p };
        (
            floor(expected - draw_rate / 2.0),
            floor(1.0 - expected - draw_rate / 2.0),
        )
    };
    let (w0, l0) = win_loss(elo0);
    let (w1, l1) = win_loss(elo1);
    f64::from(wins) * (w1 / w0).ln() + f64::from(losses) * (l1 / l0).ln()
}

/// Where the test stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SprtVerdict {
    /// Neither bound has been reached.
    #[default]
    Pending,
    /// The upper bound was reached: the first engine is stronger.
    AcceptH1,
    /// The lower bound was reached: the difference is within `elo0`.
    AcceptH0,
}

/// Running SPRT state.
#[derive(Debug, Clone)]
pub struct Sprt {
    config: SprtConfig,
    lower: f64,
    upper: f64,
    llr: f64,
    verdict: SprtVerdict,
}

impl Sprt {
    pub fn new(config: SprtConfig) -> Self {
        let lower = (config.beta / (1.0 - config.alpha)).ln();
        let upper = ((1.0 - config.beta) / config.alpha).ln();
        Self {
            config,
            lower,
            upper,
            llr: 0.0,
            verdict: SprtVerdict::Pending,
        }
    }

    pub fn config(&self) -> &SprtConfig {
        &self.config
    }

    /// `(lower, upper)` LLR bounds.
    pub fn bounds(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    pub fn llr(&self) -> f64 {
        self.llr
    }

    pub fn verdict(&self) -> SprtVerdict {
        self.verdict
    }

    pub fn is_finished(&self) -> bool {
        self.verdict != SprtVerdict::Pending
    }

    /// Recomputes the LLR from match totals and checks the bounds.
    ///
    /// Does nothing once a verdict has been reached or while no game has
    /// completed.
    pub fn update(&mut self, wins: u32, losses: u32, draws: u32) -> SprtVerdict {
        if self.is_finished() || wins + losses + draws == 0 {
            return self.verdict;
        }
        self.llr = log_likelihood_ratio(self.config.elo0, self.config.elo1, wins, losses, draws);
        if self.llr >= self.upper {
            self.verdict = SprtVerdict::AcceptH1;
        } else if self.llr <= self.lower {
            self.verdict = SprtVerdict::AcceptH0;
        }
        if self.is_finished() {
            tracing::info!(
                "SPRT finished with LLR {:.3} after {} games: {:?}",
                self.llr,
                wins + losses + draws,
                self.verdict
            );
        }
        self.verdict
    }
}
