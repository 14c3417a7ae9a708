//! Outgoing transfers for approved proposals
//!
//! Approval already debited the balance and wrote a `transfer` block with
//! `payoutStatus = pending`. Paying out only records the provider reference
//! on the proposal; ledger blocks are never rewritten.

use crate::{
    config::PayoutConfig,
    governance::ProposalMachine,
    types::{format_rupiah, Proposal, ProposalAction, ProposalStatus, Recipient},
    Error, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Payout instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRequest {
    /// Idempotency key, stable per proposal
    pub idempotency_key: String,
    /// Beneficiary
    pub recipient: Recipient,
    /// Amount (minor units)
    pub amount: i64,
    /// Transfer notes
    pub notes: String,
}

/// Provider answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutReceipt {
    /// Provider reference
    pub reference: String,
    /// Provider status (`completed`, `queued`, ...)
    pub status: String,
}

/// Payout provider trait
#[async_trait]
pub trait PayoutConnector: Send + Sync + std::fmt::Debug {
    /// Send money to a bank account or e-wallet
    async fn send_payout(&self, request: &PayoutRequest) -> Result<PayoutReceipt>;

    /// Current provider status of a sent payout
    async fn payout_status(&self, reference: &str) -> Result<PayoutReceipt>;

    /// Connector name
    fn name(&self) -> &str;
}

/// Connector for the configured provider
pub fn connector_for(config: &PayoutConfig) -> Result<Arc<dyn PayoutConnector>> {
    match config.api_key.as_deref() {
        Some(key) if !key.is_empty() => Ok(Arc::new(IrisPayoutConnector::new(config)?)),
        _ => Ok(Arc::new(MockPayoutConnector)),
    }
}

/// Simulated payouts
#[derive(Debug, Clone, Copy, Default)]
pub struct MockPayoutConnector;

#[async_trait]
impl PayoutConnector for MockPayoutConnector {
    async fn send_payout(&self, request: &PayoutRequest) -> Result<PayoutReceipt> {
        let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(9).collect();
        let reference = format!("MOCK-{}-{}", Utc::now().timestamp_millis(), suffix);
        info!(
            reference = %reference,
            bank = %request.recipient.bank,
            amount = %format_rupiah(request.amount),
            "[MOCK] Payout simulated"
        );
        Ok(PayoutReceipt {
            reference,
            status: "completed".to_string(),
        })
    }

    async fn payout_status(&self, reference: &str) -> Result<PayoutReceipt> {
        Ok(PayoutReceipt {
            reference: reference.to_string(),
            status: "completed".to_string(),
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Iris disbursement API client
#[derive(Debug)]
pub struct IrisPayoutConnector {
    api_key: String,
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct IrisResponse {
    #[serde(default)]
    payouts: Vec<IrisPayout>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IrisPayout {
    reference_no: Option<String>,
    status: Option<String>,
}

impl IrisPayoutConnector {
    /// Create a client from payout configuration
    pub fn new(config: &PayoutConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::Config("Iris connector needs an API key".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Gateway(e.to_string()))?;

        Ok(Self {
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl PayoutConnector for IrisPayoutConnector {
    async fn send_payout(&self, request: &PayoutRequest) -> Result<PayoutReceipt> {
        let body = json!({
            "payouts": [{
                "beneficiary_name": request.recipient.name,
                "beneficiary_account": request.recipient.account,
                "beneficiary_bank": request.recipient.bank,
                "amount": request.amount.to_string(),
                "notes": request.notes,
            }]
        });

        let response = self
            .client
            .post(format!("{}/payouts", self.base_url))
            .basic_auth(&self.api_key, None::<&str>)
            .header("X-Idempotency-Key", &request.idempotency_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        let parsed: Option<IrisResponse> = serde_json::from_str(&text).ok();

        if !status.is_success() {
            let message = parsed
                .and_then(|r| r.error_message)
                .unwrap_or_else(|| format!("Payout failed with HTTP {}", status.as_u16()));
            warn!(key = %request.idempotency_key, status = status.as_u16(), "Payout rejected");
            return Err(Error::Gateway(message));
        }

        let payout = parsed
            .and_then(|r| r.payouts.into_iter().next())
            .ok_or_else(|| Error::Gateway("Payout response without payouts".to_string()))?;

        Ok(PayoutReceipt {
            reference: payout.reference_no.unwrap_or_else(|| "unknown".to_string()),
            status: payout.status.unwrap_or_else(|| "queued".to_string()),
        })
    }

    async fn payout_status(&self, reference: &str) -> Result<PayoutReceipt> {
        let response = self
            .client
            .get(format!("{}/payouts/{}", self.base_url, reference))
            .basic_auth(&self.api_key, None::<&str>)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<IrisResponse>(&text)
                .ok()
                .and_then(|r| r.error_message)
                .unwrap_or_else(|| format!("Payout lookup failed with HTTP {}", status.as_u16()));
            warn!(reference, status = status.as_u16(), "Payout lookup rejected");
            return Err(Error::Gateway(message));
        }

        let payout: IrisPayout = serde_json::from_str(&text)?;
        Ok(PayoutReceipt {
            reference: payout.reference_no.unwrap_or_else(|| reference.to_string()),
            status: payout
                .status
                .ok_or_else(|| Error::Gateway("Payout lookup without status".to_string()))?,
        })
    }

    fn name(&self) -> &str {
        "iris"
    }
}

/// Pays out approved transfer proposals
#[derive(Debug, Clone)]
pub struct PayoutDispatcher {
    proposals: ProposalMachine,
    connector: Arc<dyn PayoutConnector>,
}

impl PayoutDispatcher {
    /// Create a dispatcher
    pub fn new(proposals: ProposalMachine, connector: Arc<dyn PayoutConnector>) -> Self {
        Self {
            proposals,
            connector,
        }
    }

    /// Send the payout for an approved transfer and mark it executed
    pub async fn dispatch_payout(&self, org_id: &str, proposal_id: &str) -> Result<Proposal> {
        let proposal = self.proposals.get_proposal(org_id, proposal_id)?;
        let (amount, recipient) = match &proposal.action {
            ProposalAction::Transfer { amount, recipient } => (*amount, recipient.clone()),
            _ => {
                return Err(Error::Validation(format!(
                    "Proposal {} is not a transfer",
                    proposal_id
                )))
            }
        };
        if proposal.status != ProposalStatus::Approved || proposal.payout_ref.is_some() {
            return Err(Error::Validation(format!(
                "Proposal {} is {}, only approved transfers can be paid out",
                proposal_id, proposal.status
            )));
        }

        let request = PayoutRequest {
            idempotency_key: format!("payout-{}", proposal.id),
            recipient,
            amount,
            notes: proposal.title.clone(),
        };
        let receipt = self.connector.send_payout(&request).await?;

        info!(
            org_id,
            proposal_id,
            connector = self.connector.name(),
            reference = %receipt.reference,
            status = %receipt.status,
            "Payout dispatched"
        );
        self.proposals
            .mark_executed(org_id, proposal_id, &receipt.reference)
    }

    /// Ask the provider where the payout of an executed transfer stands
    pub async fn payout_status(&self, org_id: &str, proposal_id: &str) -> Result<PayoutReceipt> {
        let proposal = self.proposals.get_proposal(org_id, proposal_id)?;
        let reference = proposal.payout_ref.ok_or_else(|| {
            Error::Validation(format!("Proposal {} has not been paid out", proposal_id))
        })?;
        self.connector.payout_status(&reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> PayoutRequest {
        PayoutRequest {
            idempotency_key: "payout-p-1".to_string(),
            recipient: Recipient {
                name: "Budi".to_string(),
                bank: "bca".to_string(),
                account: "1234567890".to_string(),
            },
            amount: 20_000,
            notes: "Sewa tenda".to_string(),
        }
    }

    #[tokio::test]
    async fn test_mock_payout() {
        let connector = connector_for(&PayoutConfig::default()).unwrap();
        let receipt = connector.send_payout(&request()).await.unwrap();
        assert!(receipt.reference.starts_with("MOCK-"));
        assert_eq!(receipt.status, "completed");
    }

    #[tokio::test]
    async fn test_iris_payout_sends_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payouts"))
            .and(header("X-Idempotency-Key", "payout-p-1"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "payouts": [{"status": "queued", "reference_no": "ref-123"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = PayoutConfig {
            api_key: Some("iris-key".to_string()),
            base_url: server.uri(),
            ..PayoutConfig::default()
        };
        let connector = IrisPayoutConnector::new(&config).unwrap();
        let receipt = connector.send_payout(&request()).await.unwrap();
        assert_eq!(receipt.reference, "ref-123");
        assert_eq!(receipt.status, "queued");
    }

    #[tokio::test]
    async fn test_iris_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payouts"))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_json(json!({"error_message": "Beneficiary not found"})),
            )
            .mount(&server)
            .await;

        let config = PayoutConfig {
            api_key: Some("iris-key".to_string()),
            base_url: server.uri(),
            ..PayoutConfig::default()
        };
        let connector = IrisPayoutConnector::new(&config).unwrap();
        match connector.send_payout(&request()).await {
            Err(Error::Gateway(message)) => assert_eq!(message, "Beneficiary not found"),
            other => panic!("expected gateway error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mock_payout_status() {
        let receipt = MockPayoutConnector.payout_status("MOCK-1-abc").await.unwrap();
        assert_eq!(receipt.reference, "MOCK-1-abc");
        assert_eq!(receipt.status, "completed");
    }

    #[tokio::test]
    async fn test_iris_payout_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payouts/ref-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "reference_no": "ref-123",
                "status": "completed",
                "amount": "20000.00"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/payouts/ref-404"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"error_message": "Payout not found"})),
            )
            .mount(&server)
            .await;

        let config = PayoutConfig {
            api_key: Some("iris-key".to_string()),
            base_url: server.uri(),
            ..PayoutConfig::default()
        };
        let connector = IrisPayoutConnector::new(&config).unwrap();
        let receipt = connector.payout_status("ref-123").await.unwrap();
        assert_eq!(receipt.status, "completed");

        match connector.payout_status("ref-404").await {
            Err(Error::Gateway(message)) => assert_eq!(message, "Payout not found"),
            other => panic!("expected gateway error, got {:?}", other),
        }
    }
}
