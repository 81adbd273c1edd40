use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Retry,
    Fallback,
    CodeFix,
    SimpleApproach,
    UserIntervention,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Fallback => "fallback",
            Self::CodeFix => "code_fix",
            Self::SimpleApproach => "simple_approach",
            Self::UserIntervention => "user_intervention",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ranked candidate remediation. Higher `priority` is tried first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairStrategy {
    #[serde(rename = "type")]
    pub kind: StrategyKind,
    pub description: String,
    pub action: String,
    pub priority: u32,
    pub estimated_success_rate: f64,
}

impl RepairStrategy {
    pub fn new(
        kind: StrategyKind,
        action: impl Into<String>,
        description: impl Into<String>,
        priority: u32,
        estimated_success_rate: f64,
    ) -> Self {
        Self {
            kind,
            description: description.into(),
            action: action.into(),
            priority,
            estimated_success_rate,
        }
    }

    pub fn user_intervention(description: impl Into<String>) -> Self {
        Self::new(
            StrategyKind::UserIntervention,
            "",
            description,
            0,
            0.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_serializes_kind_as_type() {
        let strategy = RepairStrategy::new(
            StrategyKind::CodeFix,
            "fix_syntax",
            "Fix syntax error",
            100,
            0.4,
        );
        let json = serde_json::to_value(&strategy).unwrap();
        assert_eq!(json["type"], "code_fix");
        assert_eq!(json["action"], "fix_syntax");
    }

    #[test]
    fn test_user_intervention_has_lowest_priority() {
        let strategy = RepairStrategy::user_intervention("manual");
        assert_eq!(strategy.kind, StrategyKind::UserIntervention);
        assert_eq!(strategy.priority, 0);
    }
}
