use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Backend subsystem a request is scoped to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    Clearland,
    Slum,
    Saleable,
}

impl Workflow {
    pub const ALL: [Self; 3] = [Self::Clearland, Self::Slum, Self::Saleable];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clearland => "clearland",
            Self::Slum => "slum",
            Self::Saleable => "saleable",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "clearland" => Some(Self::Clearland),
            "slum" => Some(Self::Slum),
            "saleable" => Some(Self::Saleable),
            _ => None,
        }
    }
}

impl Display for Workflow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every operation the gateway exposes. Each one has exactly one entry in
/// [`crate::POLICY_TABLE`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    AuthMe,
    SettlementDiagnostics,
    BidsAsk,
    BidsPreferences,
    MembershipEnroll,
    PhaseCurrent,
    PhaseHistory,
    PhaseTransition,
    ContractsByProject,
    RoundsCurrent,
    RoundsLock,
    RoundOpen,
    RoundClose,
    RoundLock,
    DocumentUpload,
}

impl Operation {
    pub const ALL: [Self; 15] = [
        Self::AuthMe,
        Self::SettlementDiagnostics,
        Self::BidsAsk,
        Self::BidsPreferences,
        Self::MembershipEnroll,
        Self::PhaseCurrent,
        Self::PhaseHistory,
        Self::PhaseTransition,
        Self::ContractsByProject,
        Self::RoundsCurrent,
        Self::RoundsLock,
        Self::RoundOpen,
        Self::RoundClose,
        Self::RoundLock,
        Self::DocumentUpload,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthMe => "auth_me",
            Self::SettlementDiagnostics => "settlement_diagnostics",
            Self::BidsAsk => "bids_ask",
            Self::BidsPreferences => "bids_preferences",
            Self::MembershipEnroll => "membership_enroll",
            Self::PhaseCurrent => "phase_current",
            Self::PhaseHistory => "phase_history",
            Self::PhaseTransition => "phase_transition",
            Self::ContractsByProject => "contracts_by_project",
            Self::RoundsCurrent => "rounds_current",
            Self::RoundsLock => "rounds_lock",
            Self::RoundOpen => "round_open",
            Self::RoundClose => "round_close",
            Self::RoundLock => "round_lock",
            Self::DocumentUpload => "document_upload",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|operation| operation.as_str() == value)
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_parse_is_case_insensitive_and_closed() {
        assert_eq!(Workflow::parse("Clearland"), Some(Workflow::Clearland));
        assert_eq!(Workflow::parse(" slum "), Some(Workflow::Slum));
        assert_eq!(Workflow::parse("farmland"), None);
        assert_eq!(Workflow::parse(""), None);
    }

    #[test]
    fn operation_names_are_unique_and_parse_back() {
        let mut seen = std::collections::BTreeSet::new();
        for operation in Operation::ALL {
            assert!(seen.insert(operation.as_str()), "duplicate name {operation}");
            assert_eq!(Operation::parse(operation.as_str()), Some(operation));
        }
        assert_eq!(Operation::parse("rounds/unlock"), None);
    }
}
