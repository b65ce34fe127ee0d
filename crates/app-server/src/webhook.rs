use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use arena_domain::{RegionId, RewardReason, Session};
use audit_log::health::HealthAlertSink;
use payout_pipeline::PayoutNotifier;

/// Fire-and-forget chat webhook. Delivery failure is logged, never
/// retried, and never blocks the pipeline.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: Option<String>,
    region: RegionId,
    client: reqwest::Client,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(url: Option<String>, region: RegionId) -> Self {
        Self {
            url,
            region,
            client: reqwest::Client::new(),
        }
    }

    fn post_fire_and_forget(&self, payload: Value) {
        let Some(url) = self.url.clone() else {
            debug!("webhook not configured, notification dropped");
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(err) = client.post(&url).json(&payload).send().await {
                warn!(error = %err, "webhook delivery failed");
            }
        });
    }
}

fn reason_line(reason: &RewardReason) -> String {
    match reason {
        RewardReason::Tier { tier } => format!("cash-out tier {tier}"),
        RewardReason::Bonus { label } => format!("bonus: {label}"),
        RewardReason::KillCredit { victim } => format!("kill credit ({victim})"),
        RewardReason::FeeSplit { share } => format!("fee split ({share:?})"),
        RewardReason::Prize { interval_kills } => {
            format!("interval prize ({interval_kills} kills)")
        }
    }
}

pub(crate) fn payout_success_message(session: &Session, transfer_id: &str) -> String {
    let mut lines = vec![format!(
        "paid {} to {} ({})",
        session.total_accrued, session.display_name, transfer_id
    )];
    for entry in &session.ledger {
        lines.push(format!("  + {} — {}", entry.amount, reason_line(&entry.reason)));
    }
    lines.join("\n")
}

#[async_trait]
impl PayoutNotifier for WebhookNotifier {
    async fn payout_succeeded(
        &self,
        session: &Session,
        transfer_id: &str,
    ) -> Result<(), String> {
        self.post_fire_and_forget(json!({
            "kind": "payout_succeeded",
            "region": self.region,
            "player": session.player,
            "amount": session.total_accrued,
            "transfer_id": transfer_id,
            "content": payout_success_message(session, transfer_id),
        }));
        Ok(())
    }

    async fn payout_failed(&self, session: &Session, error: &str) -> Result<(), String> {
        self.post_fire_and_forget(json!({
            "kind": "payout_failed",
            "severity": "high",
            "region": self.region,
            "player": session.player,
            "amount": session.total_accrued,
            "content": format!(
                "PAYOUT FAILED for {} ({}): {}",
                session.display_name, session.total_accrued, error
            ),
        }));
        Ok(())
    }
}

#[async_trait]
impl HealthAlertSink for WebhookNotifier {
    async fn service_down(&self) -> Result<(), String> {
        self.post_fire_and_forget(json!({
            "kind": "settlement_service_down",
            "severity": "high",
            "region": self.region,
            "content": "settlement service is DOWN, payouts will retry",
        }));
        Ok(())
    }

    async fn service_recovered(&self) -> Result<(), String> {
        self.post_fire_and_forget(json!({
            "kind": "settlement_service_recovered",
            "region": self.region,
            "content": "settlement service recovered",
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use arena_domain::{Amount, PlayerId};

    use super::*;

    #[test]
    fn success_message_includes_ledger_breakdown() {
        let mut session = Session::new(
            PlayerId::from("p1"),
            "Ace",
            RegionId::from("eu-1"),
            true,
        );
        session
            .credit(Amount(200), RewardReason::Tier { tier: 1 })
            .expect("credit");
        session
            .credit(
                Amount(350),
                RewardReason::KillCredit {
                    victim: PlayerId::from("p2"),
                },
            )
            .expect("credit");

        let message = payout_success_message(&session, "tx123");
        assert!(message.contains("paid 550 to Ace (tx123)"));
        assert!(message.contains("cash-out tier 1"));
        assert!(message.contains("kill credit (p2)"));
    }
}
