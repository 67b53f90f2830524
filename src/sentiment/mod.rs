// =============================================================================
// Sentiment aggregator — weighted multi-source score with rolling smoothing
// =============================================================================
//
// Each cycle pulls text from every configured source, scores it, weights by
// source kind, and pushes the raw aggregate into a rolling window. The rest of
// the system only ever reads `latest(smoothed)` — always available, 0.0 until
// the first cycle completes. Threshold alerts are rate-limited per direction.
// =============================================================================

pub mod lexicon;
pub mod sources;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alert::Alerter;
use crate::config::SentimentConfig;
use crate::sentiment::sources::FeedSource;
use crate::types::Severity;

/// Per-source result of one aggregation cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReading {
    pub source: String,
    pub kind: String,
    pub score: f64,
    pub sample_count: usize,
}

/// Snapshot of the aggregator state.
#[derive(Debug, Clone, Serialize)]
pub struct SentimentSnapshot {
    pub raw: f64,
    pub smoothed: f64,
    pub cycles_completed: u64,
    pub breakdown: Vec<SourceReading>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AlertDirection {
    Positive,
    Negative,
}

#[derive(Debug, Default)]
struct Inner {
    raw: f64,
    smoothed: f64,
    window: VecDeque<f64>,
    breakdown: Vec<SourceReading>,
    cycles_completed: u64,
}

pub struct SentimentAgent {
    config: SentimentConfig,
    sources: Vec<FeedSource>,
    client: reqwest::Client,
    alerter: Arc<Alerter>,
    inner: RwLock<Inner>,
    last_alert: Mutex<HashMap<AlertDirection, Instant>>,
}

impl SentimentAgent {
    pub fn new(config: SentimentConfig, sources: Vec<FeedSource>, alerter: Arc<Alerter>) -> Self {
        Self {
            config,
            sources,
            client: reqwest::Client::new(),
            alerter,
            inner: RwLock::new(Inner::default()),
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Read side — the contract everyone else consumes
    // -------------------------------------------------------------------------

    /// Latest market-sentiment scalar in [-1, 1]. Defaults to 0.0 until the
    /// first cycle completes.
    pub fn latest(&self, smoothed: bool) -> f64 {
        let inner = self.inner.read();
        if smoothed {
            inner.smoothed
        } else {
            inner.raw
        }
    }

    pub fn snapshot(&self) -> SentimentSnapshot {
        let inner = self.inner.read();
        SentimentSnapshot {
            raw: inner.raw,
            smoothed: inner.smoothed,
            cycles_completed: inner.cycles_completed,
            breakdown: inner.breakdown.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Aggregation
    // -------------------------------------------------------------------------

    /// Fold one cycle's per-source readings into the rolling state.
    ///
    /// Weighted average over sources that produced samples; sources with zero
    /// samples are excluded so a dead feed does not drag the score to zero.
    pub fn ingest(&self, readings: Vec<SourceReading>) {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;

        for reading in &readings {
            if reading.sample_count == 0 {
                continue;
            }
            let weight = self
                .config
                .source_weights
                .get(&reading.kind)
                .copied()
                .unwrap_or(1.0);
            weighted_sum += reading.score * weight;
            weight_total += weight;
        }

        let raw = if weight_total > 0.0 {
            (weighted_sum / weight_total).clamp(-1.0, 1.0)
        } else {
            0.0
        };

        let smoothed = {
            let mut inner = self.inner.write();
            inner.raw = raw;
            inner.window.push_back(raw);
            while inner.window.len() > self.config.smoothing_window {
                inner.window.pop_front();
            }
            inner.smoothed = inner.window.iter().sum::<f64>() / inner.window.len() as f64;
            inner.breakdown = readings;
            inner.cycles_completed += 1;
            inner.smoothed
        };

        debug!(raw, smoothed, "sentiment cycle ingested");
        self.check_alerts(smoothed);
    }

    /// Fire a threshold alert when `smoothed` reaches either configured bound,
    /// rate-limited by a per-direction cooldown. Returns whether one fired.
    fn check_alerts(&self, smoothed: f64) -> bool {
        let direction = if smoothed >= self.config.alert_threshold_positive {
            AlertDirection::Positive
        } else if smoothed <= self.config.alert_threshold_negative {
            AlertDirection::Negative
        } else {
            return false;
        };

        let cooldown = Duration::from_secs(self.config.alert_cooldown_minutes * 60);
        {
            let mut last = self.last_alert.lock();
            if let Some(at) = last.get(&direction) {
                if at.elapsed() < cooldown {
                    return false;
                }
            }
            last.insert(direction, Instant::now());
        }

        let text = match direction {
            AlertDirection::Positive => {
                format!("Market sentiment strongly positive: {smoothed:.3}")
            }
            AlertDirection::Negative => {
                format!("Market sentiment strongly negative: {smoothed:.3}")
            }
        };
        self.alerter.send(&text, Severity::Warning);
        true
    }

    /// Run one full fetch-score-ingest cycle.
    pub async fn run_cycle(&self) {
        let mut readings = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let texts = source.fetch(&self.client).await;
            let (score, sample_count) = lexicon::score_batch(&texts);
            readings.push(SourceReading {
                source: source.name().to_string(),
                kind: source.kind().to_string(),
                score,
                sample_count,
            });
        }
        self.ingest(readings);
    }

    /// Service loop on the sentiment cadence (minutes, not seconds).
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("sentiment analysis disabled by config");
            return;
        }

        info!(
            interval_minutes = self.config.fetch_interval_minutes,
            sources = self.sources.len(),
            "sentiment agent started"
        );

        let interval = Duration::from_secs(self.config.fetch_interval_minutes * 60);
        loop {
            self.run_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
        }
        warn!("sentiment agent stopped");
    }
}

impl std::fmt::Debug for SentimentAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SentimentAgent")
            .field("raw", &inner.raw)
            .field("smoothed", &inner.smoothed)
            .field("cycles", &inner.cycles_completed)
            .field("sources", &self.sources.len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn reading(kind: &str, score: f64, samples: usize) -> SourceReading {
        SourceReading {
            source: kind.to_string(),
            kind: kind.to_string(),
            score,
            sample_count: samples,
        }
    }

    fn agent(config: SentimentConfig) -> SentimentAgent {
        SentimentAgent::new(config, Vec::new(), Arc::new(Alerter::disabled()))
    }

    #[test]
    fn defaults_to_zero_before_first_cycle() {
        let agent = agent(SentimentConfig::default());
        assert_eq!(agent.latest(true), 0.0);
        assert_eq!(agent.latest(false), 0.0);
        assert_eq!(agent.snapshot().cycles_completed, 0);
    }

    #[test]
    fn weighted_average_respects_source_weights() {
        let mut config = SentimentConfig::default();
        config.source_weights.insert("forum".to_string(), 3.0);
        config.source_weights.insert("news".to_string(), 1.0);
        let agent = agent(config);

        agent.ingest(vec![reading("forum", 1.0, 5), reading("news", -1.0, 5)]);
        // (1.0*3 + -1.0*1) / 4 = 0.5
        assert!((agent.latest(false) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn dead_sources_are_excluded() {
        let agent = agent(SentimentConfig::default());
        agent.ingest(vec![reading("forum", 0.8, 10), reading("news", 0.0, 0)]);
        assert!((agent.latest(false) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn smoothing_window_averages_recent_cycles() {
        let mut config = SentimentConfig::default();
        config.smoothing_window = 2;
        let agent = agent(config);

        agent.ingest(vec![reading("forum", 1.0, 1)]);
        agent.ingest(vec![reading("forum", 0.0, 1)]);
        assert!((agent.latest(true) - 0.5).abs() < 1e-9);

        // Third cycle evicts the first.
        agent.ingest(vec![reading("forum", 0.0, 1)]);
        assert!(agent.latest(true).abs() < 1e-9);
    }

    #[test]
    fn alert_fires_at_exactly_the_threshold() {
        let mut config = SentimentConfig::default();
        config.alert_threshold_positive = 0.5;
        let agent = agent(config);
        assert!(agent.check_alerts(0.5));
    }

    #[test]
    fn second_cross_inside_cooldown_is_suppressed() {
        let mut config = SentimentConfig::default();
        config.alert_threshold_positive = 0.5;
        config.alert_cooldown_minutes = 60;
        let agent = agent(config);
        assert!(agent.check_alerts(0.6));
        assert!(!agent.check_alerts(0.7));
        // Opposite direction has its own cooldown.
        assert!(agent.check_alerts(-0.9));
    }

    #[test]
    fn neutral_score_never_alerts() {
        let agent = agent(SentimentConfig::default());
        assert!(!agent.check_alerts(0.0));
        assert!(!agent.check_alerts(0.49));
    }

    #[test]
    fn all_dead_sources_yield_neutral_cycle() {
        let agent = agent(SentimentConfig::default());
        agent.ingest(vec![reading("forum", 0.0, 0), reading("news", 0.0, 0)]);
        assert_eq!(agent.latest(false), 0.0);
        assert_eq!(agent.snapshot().cycles_completed, 1);
    }
}
