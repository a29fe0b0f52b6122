use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of agents the evaluator knows how to drive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Iflow,
    Claude,
    Gemini,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Iflow, AgentKind::Claude, AgentKind::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iflow => "iflow",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "iflow" => Some(Self::Iflow),
            "claude" => Some(Self::Claude),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_kind_parse() {
        assert_eq!(AgentKind::parse("claude"), Some(AgentKind::Claude));
        assert_eq!(AgentKind::parse(" Gemini "), Some(AgentKind::Gemini));
        assert_eq!(AgentKind::parse("copilot"), None);
    }

    #[test]
    fn test_agent_kind_serialization() {
        let json = serde_json::to_string(&AgentKind::Iflow).unwrap();
        assert_eq!(json, "\"iflow\"");
        for kind in AgentKind::ALL {
            assert_eq!(AgentKind::parse(kind.as_str()), Some(kind));
        }
    }
}
