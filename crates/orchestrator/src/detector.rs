//! Compression detection over a session's context-remaining signals.
//!
//! Extraction turns whatever an agent reports (a native percentage, free-form
//! status text, or nothing at all) into a [`CompressionSignal`]. Detection is
//! a pure function of the accepted signal history and the thresholds.

use std::sync::OnceLock;

use membreak_core::{CompressionMethod, CompressionSignal, CompressionVerdict, SignalAvailability};
use regex::Regex;

use crate::config::DetectorConfig;

/// What an agent can tell us about its context usage.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    /// Remaining context as a percentage, straight from the agent.
    Native { remaining_pct: f64 },
    /// Raw status output that still has to be scraped.
    Text(String),
    Unsupported,
}

static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn patterns() -> &'static [Regex] {
    PATTERNS.get_or_init(|| {
        [
            // "42% context left", "42.5 % of context remaining"
            r"(?i)(\d{1,3}(?:\.\d+)?)\s*%\s*(?:of\s+)?(?:the\s+)?context\s+(?:left|remaining|available)",
            // "Context remaining: 42%", "context left 42 %"
            r"(?i)context\s+(?:left|remaining|available)\s*[:=]?\s*(\d{1,3}(?:\.\d+)?)\s*%",
            // "context: 42/100", "Context 12000/200000"
            r"(?i)context\s*[:=]?\s*(\d+(?:\.\d+)?)\s*/\s*(\d+(?:\.\d+)?)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Scrapes a context-remaining percentage out of status text.
///
/// Returns `None` for text that matches nothing or yields a value outside
/// 0-100. Never panics on malformed input.
pub fn parse_remaining(text: &str) -> Option<f64> {
    for re in patterns() {
        let Some(caps) = re.captures(text) else {
            continue;
        };
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let value = match caps.get(2) {
            Some(total) => {
                let total: f64 = total.as_str().parse().ok()?;
                if total <= 0.0 {
                    return None;
                }
                value / total * 100.0
            }
            None => value,
        };
        return (value.is_finite() && (0.0..=100.0).contains(&value)).then_some(value);
    }
    None
}

pub fn extract_signal(iteration: u32, report: &StatusReport) -> CompressionSignal {
    match report {
        StatusReport::Native { remaining_pct } => {
            CompressionSignal::new(iteration, Some(*remaining_pct), format!("{remaining_pct}%"))
        }
        StatusReport::Text(text) => CompressionSignal::new(iteration, parse_remaining(text), text.clone()),
        StatusReport::Unsupported => CompressionSignal::unsupported(iteration),
    }
}

/// Accepted signals for one session, strictly increasing by iteration.
#[derive(Debug, Clone, Default)]
pub struct SignalHistory {
    signals: Vec<CompressionSignal>,
}

impl SignalHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `signal` unless its iteration is not newer than the last one.
    pub fn push(&mut self, signal: CompressionSignal) -> bool {
        if let Some(last) = self.signals.last() {
            if signal.iteration <= last.iteration {
                return false;
            }
        }
        self.signals.push(signal);
        true
    }

    pub fn latest(&self) -> Option<&CompressionSignal> {
        self.signals.last()
    }

    pub fn previous(&self) -> Option<&CompressionSignal> {
        self.signals.len().checked_sub(2).and_then(|i| self.signals.get(i))
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Best availability seen so far: any numeric reading wins over text we
    /// could not parse, which wins over an agent with no status at all.
    pub fn availability(&self) -> SignalAvailability {
        let mut best = SignalAvailability::Unsupported;
        for signal in &self.signals {
            match signal.availability {
                SignalAvailability::Numeric => return SignalAvailability::Numeric,
                SignalAvailability::Unparseable => best = SignalAvailability::Unparseable,
                SignalAvailability::Unsupported => {}
            }
        }
        best
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressionDetector {
    low_threshold: f64,
    jump_threshold: f64,
    iteration_cap: Option<u32>,
}

impl Default for CompressionDetector {
    fn default() -> Self {
        Self::new(&DetectorConfig::default())
    }
}

impl CompressionDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            low_threshold: config.low_threshold,
            jump_threshold: config.jump_threshold,
            iteration_cap: config.iteration_cap,
        }
    }

    /// Decides whether compression happened at the newest signal in `history`.
    pub fn evaluate(&self, history: &SignalHistory) -> Option<CompressionVerdict> {
        let latest = history.latest()?;
        let current = latest.remaining;
        let prior = history.previous().and_then(|p| p.remaining);

        if let (Some(cur), Some(prev)) = (current, prior) {
            if prev <= self.low_threshold && cur - prev >= self.jump_threshold {
                return Some(self.verdict(CompressionMethod::ContextJump, prior, current, latest, history));
            }
            if cur <= self.low_threshold && prev <= self.low_threshold {
                return Some(self.verdict(
                    CompressionMethod::PercentageThreshold,
                    prior,
                    current,
                    latest,
                    history,
                ));
            }
        }

        match self.iteration_cap {
            Some(cap) if latest.iteration + 1 >= cap => {
                Some(self.verdict(CompressionMethod::Heuristic, prior, current, latest, history))
            }
            _ => None,
        }
    }

    fn verdict(
        &self,
        method: CompressionMethod,
        before: Option<f64>,
        after: Option<f64>,
        latest: &CompressionSignal,
        history: &SignalHistory,
    ) -> CompressionVerdict {
        CompressionVerdict {
            method,
            before,
            after,
            iteration: latest.iteration,
            availability: history.availability(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_ITERATION_CAP;

    fn detector(low: f64, jump: f64, cap: Option<u32>) -> CompressionDetector {
        CompressionDetector::new(&DetectorConfig {
            low_threshold: low,
            jump_threshold: jump,
            iteration_cap: cap,
        })
    }

    /// Feeds values one at a time and returns the first verdict.
    fn run(detector: &CompressionDetector, values: &[Option<f64>]) -> Option<CompressionVerdict> {
        let mut history = SignalHistory::new();
        for (i, value) in values.iter().enumerate() {
            assert!(history.push(CompressionSignal::new(i as u32, *value, "")));
            if let Some(verdict) = detector.evaluate(&history) {
                return Some(verdict);
            }
        }
        None
    }

    fn numeric(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    #[test]
    fn test_context_jump_after_low_value() {
        let verdict = run(
            &detector(30.0, 30.0, None),
            &numeric(&[100.0, 95.0, 85.0, 30.0, 75.0]),
        )
        .unwrap();

        assert_eq!(verdict.method, CompressionMethod::ContextJump);
        assert_eq!(verdict.iteration, 4);
        assert_eq!(verdict.before, Some(30.0));
        assert_eq!(verdict.after, Some(75.0));
        assert_eq!(verdict.availability, SignalAvailability::Numeric);
    }

    #[test]
    fn test_jump_requires_low_prior_value() {
        // 40 -> 80 is a big jump, but 40 was never low.
        assert!(run(&detector(30.0, 30.0, None), &numeric(&[90.0, 40.0, 80.0])).is_none());
    }

    #[test]
    fn test_percentage_threshold_needs_two_low_readings() {
        let d = detector(30.0, 30.0, None);
        assert!(run(&d, &numeric(&[80.0, 25.0])).is_none());

        let verdict = run(&d, &numeric(&[80.0, 25.0, 20.0])).unwrap();
        assert_eq!(verdict.method, CompressionMethod::PercentageThreshold);
        assert_eq!(verdict.iteration, 2);
    }

    #[test]
    fn test_jump_beats_threshold() {
        // 10 -> 20 satisfies both numeric rules; the jump has priority.
        let verdict = run(&detector(30.0, 5.0, None), &numeric(&[50.0, 10.0, 20.0])).unwrap();
        assert_eq!(verdict.method, CompressionMethod::ContextJump);
    }

    #[test]
    fn test_heuristic_at_iteration_cap() {
        let verdict = run(
            &detector(30.0, 30.0, Some(4)),
            &numeric(&[60.0, 55.0, 50.0, 45.0]),
        )
        .unwrap();

        assert_eq!(verdict.method, CompressionMethod::Heuristic);
        assert_eq!(verdict.iteration, 3);
        assert_eq!(verdict.availability, SignalAvailability::Numeric);
    }

    #[test]
    fn test_heuristic_records_signal_availability() {
        let d = detector(30.0, 30.0, Some(3));

        let verdict = run(&d, &[None, None, None]).unwrap();
        assert_eq!(verdict.availability, SignalAvailability::Unparseable);

        let mut history = SignalHistory::new();
        for i in 0..3 {
            history.push(CompressionSignal::unsupported(i));
        }
        let verdict = d.evaluate(&history).unwrap();
        assert_eq!(verdict.method, CompressionMethod::Heuristic);
        assert_eq!(verdict.availability, SignalAvailability::Unsupported);
    }

    #[test]
    fn test_missing_values_never_fire_numeric_rules() {
        let d = detector(30.0, 30.0, None);
        assert!(run(&d, &[Some(20.0), None, Some(80.0)]).is_none());
        assert!(run(&d, &[Some(20.0), None, Some(10.0)]).is_none());
    }

    #[test]
    fn test_history_rejects_stale_iterations() {
        let mut history = SignalHistory::new();
        assert!(history.push(CompressionSignal::new(0, Some(20.0), "")));
        assert!(history.push(CompressionSignal::new(2, Some(25.0), "")));
        assert!(!history.push(CompressionSignal::new(2, Some(90.0), "")));
        assert!(!history.push(CompressionSignal::new(1, Some(90.0), "")));
        assert_eq!(history.len(), 2);

        // The rejected 90s never reach the jump computation.
        let verdict = detector(30.0, 30.0, None).evaluate(&history).unwrap();
        assert_eq!(verdict.method, CompressionMethod::PercentageThreshold);
    }

    #[test]
    fn test_default_detector_falls_back_for_signal_less_agents() {
        let detector = CompressionDetector::default();
        let mut history = SignalHistory::new();
        let mut verdict = None;
        for i in 0..DEFAULT_ITERATION_CAP {
            history.push(CompressionSignal::unsupported(i));
            verdict = detector.evaluate(&history);
            if verdict.is_some() {
                break;
            }
        }

        let verdict = verdict.unwrap();
        assert_eq!(verdict.method, CompressionMethod::Heuristic);
        assert_eq!(verdict.iteration, DEFAULT_ITERATION_CAP - 1);
        assert_eq!(verdict.availability, SignalAvailability::Unsupported);
    }

    #[test]
    fn test_empty_history() {
        assert!(CompressionDetector::default()
            .evaluate(&SignalHistory::new())
            .is_none());
    }

    #[test]
    fn test_parse_remaining_formats() {
        assert_eq!(parse_remaining("42% context left"), Some(42.0));
        assert_eq!(parse_remaining("Context remaining: 42%"), Some(42.0));
        assert_eq!(parse_remaining("context: 42/100"), Some(42.0));
        assert_eq!(parse_remaining("Context 50000/200000 tokens"), Some(25.0));
        assert_eq!(parse_remaining("status ok, 12.5 % of context available"), Some(12.5));
    }

    #[test]
    fn test_parse_remaining_malformed() {
        assert_eq!(parse_remaining(""), None);
        assert_eq!(parse_remaining("all good"), None);
        assert_eq!(parse_remaining("context: 5/0"), None);
        assert_eq!(parse_remaining("context: 300/100"), None);
        assert_eq!(parse_remaining("999% context left"), None);
        assert_eq!(parse_remaining("context: %%%/"), None);
    }

    #[test]
    fn test_extract_signal() {
        let native = extract_signal(1, &StatusReport::Native { remaining_pct: 64.0 });
        assert_eq!(native.remaining, Some(64.0));
        assert_eq!(native.availability, SignalAvailability::Numeric);

        let text = extract_signal(2, &StatusReport::Text("no idea".into()));
        assert_eq!(text.remaining, None);
        assert_eq!(text.availability, SignalAvailability::Unparseable);
        assert_eq!(text.raw, "no idea");

        let none = extract_signal(3, &StatusReport::Unsupported);
        assert_eq!(none.availability, SignalAvailability::Unsupported);
    }
}
