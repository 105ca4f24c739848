//! Request and response DTOs for the HTTP surface. Domain types that already
//! serialize cleanly (transactions, disputes, balances) go out as-is.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::escrow::DisputeDisposition;
use crate::gateway::webhook::WebhookDisposition;

#[derive(Debug, Deserialize, Validate)]
pub struct InitiatePaymentRequest {
    pub task_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    #[validate(length(min = 1, max = 2000))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DisputeRequest {
    #[validate(length(min = 1, max = 2000))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResolveDisputeRequest {
    #[validate(length(min = 1, max = 2000))]
    pub resolution: String,
    pub disposition: DisputeDisposition,
}

#[derive(Debug, Deserialize, Validate)]
pub struct FreezeRequest {
    #[validate(length(min = 1, max = 2000))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MilestoneItem {
    pub title: String,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateMilestonesRequest {
    #[validate(length(min = 1, max = 50))]
    pub milestones: Vec<MilestoneItem>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct WithdrawRequest {
    pub amount: Decimal,
    #[validate(length(min = 1, max = 100))]
    pub recipient_code: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub reference: String,
    pub outcome: &'static str,
}

impl VerifyResponse {
    pub fn new(reference: String, disposition: WebhookDisposition) -> Self {
        let outcome = match disposition {
            WebhookDisposition::Settled => "settled",
            WebhookDisposition::Duplicate => "already_settled",
            WebhookDisposition::Ignored => "pending",
        };
        Self { reference, outcome }
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}
