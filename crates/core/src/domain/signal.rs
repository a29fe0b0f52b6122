use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One context-remaining observation taken right before a deep-dive prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionSignal {
    pub iteration: u32,
    /// Percentage of context still available, 0-100. `None` when the agent
    /// reported nothing usable.
    pub remaining: Option<f64>,
    pub raw: String,
    #[serde(default)]
    pub availability: SignalAvailability,
    pub observed_at: DateTime<Utc>,
}

impl CompressionSignal {
    /// Values outside 0-100 are dropped and the signal counts as unparseable.
    pub fn new(iteration: u32, remaining: Option<f64>, raw: impl Into<String>) -> Self {
        let remaining = remaining.filter(|v| v.is_finite() && (0.0..=100.0).contains(v));
        Self {
            iteration,
            availability: if remaining.is_some() {
                SignalAvailability::Numeric
            } else {
                SignalAvailability::Unparseable
            },
            remaining,
            raw: raw.into(),
            observed_at: Utc::now(),
        }
    }

    pub fn missing(iteration: u32, raw: impl Into<String>) -> Self {
        Self::new(iteration, None, raw)
    }

    /// The agent has no way to report its context usage.
    pub fn unsupported(iteration: u32) -> Self {
        Self {
            iteration,
            remaining: None,
            raw: String::new(),
            availability: SignalAvailability::Unsupported,
            observed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    ContextJump,
    PercentageThreshold,
    Heuristic,
}

impl CompressionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContextJump => "context_jump",
            Self::PercentageThreshold => "percentage_threshold",
            Self::Heuristic => "heuristic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "context_jump" => Some(Self::ContextJump),
            "percentage_threshold" => Some(Self::PercentageThreshold),
            "heuristic" => Some(Self::Heuristic),
            _ => None,
        }
    }
}

/// What kind of numeric signal the session produced up to the verdict.
///
/// A heuristic verdict on an agent that never reports its context is not the
/// same thing as one on an agent whose status text we failed to read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignalAvailability {
    #[default]
    Numeric,
    Unparseable,
    Unsupported,
}

impl SignalAvailability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Numeric => "numeric",
            Self::Unparseable => "unparseable",
            Self::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionVerdict {
    pub method: CompressionMethod,
    pub before: Option<f64>,
    pub after: Option<f64>,
    pub iteration: u32,
    pub availability: SignalAvailability,
}

/// Write-once record of the compression event on a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompressionRecord {
    pub detected: bool,
    pub method: Option<CompressionMethod>,
    pub before: Option<f64>,
    pub after: Option<f64>,
    pub iteration: Option<u32>,
    pub availability: Option<SignalAvailability>,
    pub trigger: Option<CompressionSignal>,
    pub predecessor: Option<CompressionSignal>,
    pub detected_at: Option<DateTime<Utc>>,
}

impl CompressionRecord {
    /// Stores the verdict unless one is already recorded. Returns whether the
    /// record changed.
    pub fn record(
        &mut self,
        verdict: &CompressionVerdict,
        trigger: Option<CompressionSignal>,
        predecessor: Option<CompressionSignal>,
    ) -> bool {
        if self.detected {
            return false;
        }
        self.detected = true;
        self.method = Some(verdict.method);
        self.before = verdict.before;
        self.after = verdict.after;
        self.iteration = Some(verdict.iteration);
        self.availability = Some(verdict.availability);
        self.trigger = trigger;
        self.predecessor = predecessor;
        self.detected_at = Some(Utc::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jump_verdict() -> CompressionVerdict {
        CompressionVerdict {
            method: CompressionMethod::ContextJump,
            before: Some(30.0),
            after: Some(75.0),
            iteration: 4,
            availability: SignalAvailability::Numeric,
        }
    }

    #[test]
    fn test_signal_rejects_out_of_range_values() {
        assert_eq!(CompressionSignal::new(0, Some(42.0), "42%").remaining, Some(42.0));
        assert_eq!(CompressionSignal::new(0, Some(140.0), "140%").remaining, None);
        assert_eq!(CompressionSignal::new(0, Some(-1.0), "-1%").remaining, None);
        assert_eq!(CompressionSignal::new(0, Some(f64::NAN), "nan").remaining, None);
        assert_eq!(
            CompressionSignal::new(0, Some(140.0), "140%").availability,
            SignalAvailability::Unparseable
        );
        assert_eq!(
            CompressionSignal::unsupported(2).availability,
            SignalAvailability::Unsupported
        );
    }

    #[test]
    fn test_record_is_write_once() {
        let mut record = CompressionRecord::default();
        let trigger = CompressionSignal::new(4, Some(75.0), "75% context left");
        let predecessor = CompressionSignal::new(3, Some(30.0), "30% context left");

        assert!(record.record(&jump_verdict(), Some(trigger.clone()), Some(predecessor)));
        assert!(record.detected);
        assert_eq!(record.method, Some(CompressionMethod::ContextJump));

        let later = CompressionVerdict {
            method: CompressionMethod::Heuristic,
            before: None,
            after: None,
            iteration: 9,
            availability: SignalAvailability::Unsupported,
        };
        assert!(!record.record(&later, None, None));
        assert_eq!(record.method, Some(CompressionMethod::ContextJump));
        assert_eq!(record.iteration, Some(4));
        assert_eq!(record.trigger, Some(trigger));
    }

    #[test]
    fn test_record_round_trip() {
        let mut record = CompressionRecord::default();
        record.record(
            &jump_verdict(),
            Some(CompressionSignal::new(4, Some(75.0), "75% context left")),
            Some(CompressionSignal::new(3, Some(30.0), "Context remaining: 30%")),
        );

        let json = serde_json::to_string(&record).unwrap();
        let back: CompressionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_method_as_str() {
        assert_eq!(CompressionMethod::ContextJump.as_str(), "context_jump");
        assert_eq!(
            CompressionMethod::parse("percentage_threshold"),
            Some(CompressionMethod::PercentageThreshold)
        );
        assert_eq!(SignalAvailability::Unparseable.as_str(), "unparseable");
    }
}
