use serde::{Deserialize, Serialize};

use crate::ids::PlayerId;

/// Why an amount was credited. Each trigger carries its own payload so
/// downstream consumers never parse free-form detail strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardReason {
    Tier { tier: u8 },
    Bonus { label: String },
    KillCredit { victim: PlayerId },
    FeeSplit { share: FeeShare },
    Prize { interval_kills: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeShare {
    Creator,
    PrizePool,
}

impl RewardReason {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tier { .. } => "tier",
            Self::Bonus { .. } => "bonus",
            Self::KillCredit { .. } => "kill_credit",
            Self::FeeSplit { .. } => "fee_split",
            Self::Prize { .. } => "prize",
        }
    }
}
