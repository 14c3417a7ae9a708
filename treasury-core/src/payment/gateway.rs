//! Payment gateway interface

use crate::{config::PaymentConfig, types::PaymentMode, Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Checkout token request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    /// Order ID
    pub order_id: String,
    /// Amount (minor units)
    pub amount: i64,
    /// Payer display name
    pub customer_name: String,
    /// Payer email
    pub customer_email: String,
    /// Line item name
    pub description: String,
}

/// Hosted checkout handle; both fields are `None` in mock mode
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutToken {
    /// Gateway token
    pub token: Option<String>,
    /// Hosted checkout URL
    pub redirect_url: Option<String>,
}

/// Payment gateway trait
#[async_trait]
pub trait PaymentGateway: Send + Sync + std::fmt::Debug {
    /// Mode this gateway runs in
    fn mode(&self) -> PaymentMode;

    /// Request a checkout token for an order
    async fn create_token(&self, request: &TokenRequest) -> Result<CheckoutToken>;

    /// Gateway name
    fn name(&self) -> &str;
}

/// Gateway for the configured mode
pub fn gateway_for(config: &PaymentConfig) -> Result<Arc<dyn PaymentGateway>> {
    match config.mode() {
        PaymentMode::Mock => Ok(Arc::new(MockGateway)),
        _ => Ok(Arc::new(SnapGateway::new(config)?)),
    }
}

/// No gateway: orders settle on creation
#[derive(Debug, Clone, Copy, Default)]
pub struct MockGateway;

#[async_trait]
impl PaymentGateway for MockGateway {
    fn mode(&self) -> PaymentMode {
        PaymentMode::Mock
    }

    async fn create_token(&self, request: &TokenRequest) -> Result<CheckoutToken> {
        info!(order_id = %request.order_id, "[MOCK] Payment settles immediately");
        Ok(CheckoutToken::default())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Snap checkout API client
#[derive(Debug)]
pub struct SnapGateway {
    server_key: String,
    base_url: String,
    mode: PaymentMode,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct SnapResponse {
    token: Option<String>,
    redirect_url: Option<String>,
    #[serde(default)]
    error_messages: Vec<String>,
}

impl SnapGateway {
    /// Create a client from payment configuration
    pub fn new(config: &PaymentConfig) -> Result<Self> {
        let server_key = config
            .server_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::Config("Snap gateway needs a server key".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Gateway(e.to_string()))?;

        Ok(Self {
            server_key,
            base_url: config.snap_base_url(),
            mode: config.mode(),
            client,
        })
    }
}

#[async_trait]
impl PaymentGateway for SnapGateway {
    fn mode(&self) -> PaymentMode {
        self.mode
    }

    async fn create_token(&self, request: &TokenRequest) -> Result<CheckoutToken> {
        let body = json!({
            "transaction_details": {
                "order_id": request.order_id,
                "gross_amount": request.amount,
            },
            "customer_details": {
                "first_name": request.customer_name,
                "email": request.customer_email,
            },
            "item_details": [{
                "id": "iuran",
                "price": request.amount,
                "quantity": 1,
                "name": request.description,
            }],
        });

        let response = self
            .client
            .post(format!("{}/transactions", self.base_url))
            .basic_auth(&self.server_key, None::<&str>)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        let parsed: Option<SnapResponse> = serde_json::from_str(&text).ok();

        match parsed {
            Some(snap) if status.is_success() => {
                info!(order_id = %request.order_id, mode = self.mode.as_str(), "Snap token created");
                Ok(CheckoutToken {
                    token: snap.token,
                    redirect_url: snap.redirect_url,
                })
            }
            Some(snap) if !snap.error_messages.is_empty() => {
                warn!(order_id = %request.order_id, status = status.as_u16(), "Snap rejected order");
                Err(Error::Gateway(snap.error_messages.join(", ")))
            }
            _ => {
                warn!(order_id = %request.order_id, status = status.as_u16(), "Snap request failed");
                Err(Error::Gateway(format!(
                    "Gateway returned HTTP {}: {}",
                    status.as_u16(),
                    text
                )))
            }
        }
    }

    fn name(&self) -> &str {
        "snap"
    }
}
