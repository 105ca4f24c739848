//! Outbound half of the payment gateway boundary.
//!
//! The provider is treated as an opaque charge/transfer/refund service over
//! request/response; its own ledger is not modeled. Timeouts and retries
//! toward it are this client's concern, not the escrow engine's.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::GatewayError;

/// Provider-side status of a charge, transfer, or refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Success,
    Pending,
    Failed,
}

impl ProviderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "success" | "completed" => ProviderStatus::Success,
            "failed" | "reversed" | "abandoned" => ProviderStatus::Failed,
            _ => ProviderStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateChargeRequest {
    /// Our transaction id, doubling as the provider's idempotency reference
    pub reference: String,
    pub amount: Decimal,
    pub currency: String,
}

/// Redirect handle returned by charge initiation.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeSession {
    pub authorization_url: String,
}

#[derive(Debug, Clone)]
pub struct ProviderCharge {
    pub reference: String,
    pub provider_transaction_id: String,
    pub status: ProviderStatus,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub reference: String,
    pub amount: Decimal,
    pub recipient_code: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ProviderTransfer {
    pub provider_transfer_id: String,
    pub status: ProviderStatus,
}

#[derive(Debug, Clone)]
pub struct ProviderRefund {
    pub provider_refund_id: Option<String>,
    pub status: ProviderStatus,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_charge(&self, req: CreateChargeRequest)
        -> Result<ChargeSession, GatewayError>;

    async fn verify_charge(&self, reference: &str) -> Result<ProviderCharge, GatewayError>;

    async fn initiate_transfer(&self, req: TransferRequest)
        -> Result<ProviderTransfer, GatewayError>;

    async fn refund_charge(&self, reference: &str) -> Result<ProviderRefund, GatewayError>;
}

/// Provider response envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    id: i64,
    reference: String,
    status: String,
    amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct TransferData {
    transfer_code: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RefundData {
    id: Option<i64>,
    status: String,
}

/// HTTP implementation against the real provider API.
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl HttpGateway {
    pub fn new(base_url: String, secret_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            secret_key,
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, GatewayError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.secret_key)
            .json(&body)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    async fn unwrap_envelope<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let http_status = response.status();
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| GatewayError::RequestFailed(format!("{:?}", e)))?;

        if !http_status.is_success() || !envelope.status {
            return Err(GatewayError::Declined(envelope.message));
        }
        envelope
            .data
            .ok_or_else(|| GatewayError::MalformedEvent("missing data in response".to_string()))
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_charge(
        &self,
        req: CreateChargeRequest,
    ) -> Result<ChargeSession, GatewayError> {
        self.post(
            "/transaction/initialize",
            serde_json::json!({
                "reference": req.reference,
                "amount": req.amount,
                "currency": req.currency,
            }),
        )
        .await
    }

    async fn verify_charge(&self, reference: &str) -> Result<ProviderCharge, GatewayError> {
        let data: VerifyData = self
            .get(&format!("/transaction/verify/{}", reference))
            .await?;
        Ok(ProviderCharge {
            reference: data.reference,
            provider_transaction_id: data.id.to_string(),
            status: ProviderStatus::parse(&data.status),
            amount: data.amount,
        })
    }

    async fn initiate_transfer(
        &self,
        req: TransferRequest,
    ) -> Result<ProviderTransfer, GatewayError> {
        let data: TransferData = self
            .post(
                "/transfer",
                serde_json::json!({
                    "source": "balance",
                    "reference": req.reference,
                    "amount": req.amount,
                    "recipient": req.recipient_code,
                    "reason": req.reason,
                }),
            )
            .await?;
        Ok(ProviderTransfer {
            provider_transfer_id: data.transfer_code,
            status: ProviderStatus::parse(&data.status),
        })
    }

    async fn refund_charge(&self, reference: &str) -> Result<ProviderRefund, GatewayError> {
        let data: RefundData = self
            .post("/refund", serde_json::json!({ "transaction": reference }))
            .await?;
        Ok(ProviderRefund {
            provider_refund_id: data.id.map(|id| id.to_string()),
            status: ProviderStatus::parse(&data.status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_status_parsing() {
        assert_eq!(ProviderStatus::parse("success"), ProviderStatus::Success);
        assert_eq!(ProviderStatus::parse("completed"), ProviderStatus::Success);
        assert_eq!(ProviderStatus::parse("failed"), ProviderStatus::Failed);
        assert_eq!(ProviderStatus::parse("reversed"), ProviderStatus::Failed);
        assert_eq!(ProviderStatus::parse("ongoing"), ProviderStatus::Pending);
        assert_eq!(ProviderStatus::parse("pending"), ProviderStatus::Pending);
    }
}
