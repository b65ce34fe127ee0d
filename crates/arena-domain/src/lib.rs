pub mod ids;
pub mod money;
pub mod reward;
pub mod session;

pub use ids::{PlayerId, RegionId, SessionId, TraceId};
pub use money::{Amount, MoneyError};
pub use reward::{FeeShare, RewardReason};
pub use session::{EndReason, LedgerEntry, Session, SessionStatus};
