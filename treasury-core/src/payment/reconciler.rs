//! Deposit orders and gateway settlement callbacks
//!
//! Callbacks are delivered at least once. Crediting checks and writes a
//! credit marker keyed by order ID under the organization lock, in the same
//! write as the status change, balance delta and `payment` block, so a
//! re-delivered callback moves no money.

use super::{
    gateway::{PaymentGateway, TokenRequest},
    signature::verify_signature,
};
use crate::{
    balance::BalanceMutator,
    config::PaymentConfig,
    ledger::Ledger,
    locks::LockRegistry,
    metrics::Metrics,
    storage::Storage,
    types::{payment_status, BlockData, BlockKind, CreditMarker, PaymentMode, PaymentOrder},
    Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Deposit request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    /// Receiving organization
    pub org_id: String,
    /// Amount (minor units)
    pub amount: i64,
    /// Payer user ID
    pub payer_id: String,
    /// Payer display name
    #[serde(default)]
    pub payer_name: Option<String>,
    /// Payer email
    #[serde(default)]
    pub payer_email: Option<String>,
    /// Description
    #[serde(default)]
    pub description: Option<String>,
}

/// Created order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    /// Order ID
    pub order_id: String,
    /// Gateway token (`None` in mock mode)
    pub token: Option<String>,
    /// Hosted checkout URL (`None` in mock mode)
    pub redirect_url: Option<String>,
    /// Gateway mode
    pub mode: PaymentMode,
}

/// Fields of a gateway notification the reconciler consumes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayNotification {
    /// Order ID
    pub order_id: String,
    /// Transaction status
    pub transaction_status: String,
    /// Fraud screening result
    #[serde(default)]
    pub fraud_status: Option<String>,
    /// Gross amount as sent, e.g. `50000.00`
    pub gross_amount: String,
    /// HTTP-like status code as sent, e.g. `200`
    pub status_code: String,
    /// Hex SHA-512 signature
    #[serde(default)]
    pub signature_key: Option<String>,
}

/// What a callback did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackOutcome {
    /// Balance credited and block appended
    Credited {
        /// Amount credited
        amount: i64,
        /// Ledger block written
        block_id: Uuid,
    },
    /// Order already credited; nothing changed
    Duplicate,
    /// Status stored, no money moved
    Recorded,
}

/// Callback acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackAck {
    /// Order ID
    pub order_id: String,
    /// Order status after the callback
    pub status: String,
    /// Effect
    pub outcome: CallbackOutcome,
}

/// Canonical status for a gateway report
///
/// `capture` counts as settled only when fraud screening accepted it (or
/// did not run); otherwise it becomes `fraud`. Everything else is kept
/// verbatim.
pub fn map_status(transaction_status: &str, fraud_status: Option<&str>) -> String {
    if transaction_status == payment_status::CAPTURE {
        match fraud_status {
            None | Some("accept") => payment_status::SETTLEMENT.to_string(),
            Some(_) => payment_status::FRAUD.to_string(),
        }
    } else {
        transaction_status.to_string()
    }
}

/// Whether a canonical status means the money arrived
pub fn is_paid(status: &str) -> bool {
    status == payment_status::SETTLEMENT || status == payment_status::CAPTURE
}

/// Payment reconciler
#[derive(Debug, Clone)]
pub struct PaymentReconciler {
    storage: Arc<Storage>,
    locks: Arc<LockRegistry>,
    ledger: Ledger,
    balances: BalanceMutator,
    gateway: Arc<dyn PaymentGateway>,
    metrics: Metrics,
    config: PaymentConfig,
}

impl PaymentReconciler {
    /// Create a reconciler
    pub fn new(
        storage: Arc<Storage>,
        locks: Arc<LockRegistry>,
        ledger: Ledger,
        balances: BalanceMutator,
        gateway: Arc<dyn PaymentGateway>,
        metrics: Metrics,
        config: PaymentConfig,
    ) -> Self {
        Self {
            storage,
            locks,
            ledger,
            balances,
            gateway,
            metrics,
            config,
        }
    }

    /// Gateway mode in use
    pub fn mode(&self) -> PaymentMode {
        self.gateway.mode()
    }

    /// Open a deposit order
    ///
    /// In mock mode the order is credited before this returns.
    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<CreateOrderResponse> {
        if request.amount < self.config.min_amount {
            return Err(Error::AmountBelowMinimum {
                amount: request.amount,
                minimum: self.config.min_amount,
            });
        }
        if request.payer_id.is_empty() {
            return Err(Error::Validation("Payer is required".to_string()));
        }

        let payer_name = request
            .payer_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "User".to_string());
        let customer_email = request
            .payer_email
            .unwrap_or_else(|| "user@example.com".to_string());
        let mode = self.gateway.mode();

        // Reserve the ID by persisting the pending order before the gateway call
        let order = {
            let org_lock = self.locks.org(&request.org_id);
            let _org = org_lock.lock();
            let org = self.storage.get_org(&request.org_id)?;

            let _ids = self.locks.order_ids();
            let order_id = self.next_order_id(&org.id)?;
            let now = Utc::now();
            let order = PaymentOrder {
                order_id,
                org_id: org.id.clone(),
                payer_id: request.payer_id,
                payer_name,
                amount: request.amount,
                description: request
                    .description
                    .filter(|d| !d.trim().is_empty())
                    .unwrap_or_else(|| format!("Iuran {}", org.name)),
                status: payment_status::PENDING.to_string(),
                mode,
                created_at: now,
                updated_at: now,
                last_notification: None,
            };

            let mut ws = self.storage.write_set();
            ws.put_payment(&order)?;
            ws.commit()?;
            order
        };
        let order_id = order.order_id.clone();

        info!(
            order_id = %order_id,
            org_id = %order.org_id,
            amount = order.amount,
            mode = mode.as_str(),
            "Payment order created"
        );

        let token_request = TokenRequest {
            order_id: order_id.clone(),
            amount: order.amount,
            customer_name: order.payer_name.clone(),
            customer_email,
            description: order.description.clone(),
        };
        let token = match self.gateway.create_token(&token_request).await {
            Ok(token) => token,
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "Checkout token request failed");
                if let Err(mark) = self.apply_status(&order_id, payment_status::FAILURE, None, None)
                {
                    warn!(order_id = %order_id, error = %mark, "Could not mark order as failed");
                }
                return Err(e);
            }
        };

        if mode == PaymentMode::Mock {
            self.apply_status(&order_id, payment_status::SETTLEMENT, None, None)?;
        }

        Ok(CreateOrderResponse {
            order_id,
            token: token.token,
            redirect_url: token.redirect_url,
            mode,
        })
    }

    /// Handle a raw gateway notification body
    pub fn handle_callback(&self, raw_payload: &str) -> Result<CallbackAck> {
        let notification: GatewayNotification = serde_json::from_str(raw_payload)
            .map_err(|e| Error::Validation(format!("Malformed notification: {}", e)))?;
        self.handle_notification(&notification, Some(raw_payload))
    }

    /// Handle a parsed gateway notification
    pub fn handle_notification(
        &self,
        notification: &GatewayNotification,
        raw_payload: Option<&str>,
    ) -> Result<CallbackAck> {
        if notification.order_id.is_empty() {
            return Err(Error::Validation("Missing order_id".to_string()));
        }

        // Without a server key there is nothing to check against
        if let Some(server_key) = self.config.server_key.as_deref().filter(|k| !k.is_empty()) {
            let supplied = notification.signature_key.as_deref().unwrap_or_default();
            if !verify_signature(
                &notification.order_id,
                &notification.status_code,
                &notification.gross_amount,
                server_key,
                supplied,
            ) {
                self.metrics.record_rejected_callback();
                warn!(order_id = %notification.order_id, "Rejected callback with invalid signature");
                return Err(Error::InvalidSignature(notification.order_id.clone()));
            }
        }

        let status = map_status(
            &notification.transaction_status,
            notification.fraud_status.as_deref(),
        );
        self.apply_status(
            &notification.order_id,
            &status,
            raw_payload,
            Some(&notification.gross_amount),
        )
    }

    /// Payment order by ID
    pub fn get_order(&self, order_id: &str) -> Result<PaymentOrder> {
        self.storage.get_payment(order_id)
    }

    /// Payment orders of an organization, oldest first
    pub fn list_orders(&self, org_id: &str) -> Result<Vec<PaymentOrder>> {
        let mut orders = self.storage.list_org_payments(org_id)?;
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    /// First free `{prefix}-{org prefix}-{millis}`. Caller holds the order ID guard.
    fn next_order_id(&self, org_id: &str) -> Result<String> {
        let short: String = org_id.chars().take(6).collect();
        let mut millis = Utc::now().timestamp_millis();
        loop {
            let candidate = format!("{}-{}-{}", self.config.order_prefix, short, millis);
            match self.storage.get_payment(&candidate) {
                Err(Error::PaymentNotFound(_)) => return Ok(candidate),
                Ok(_) => millis += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Store a new status and, if paid and not yet credited, move the money
    fn apply_status(
        &self,
        order_id: &str,
        status: &str,
        raw_payload: Option<&str>,
        gross_amount: Option<&str>,
    ) -> Result<CallbackAck> {
        let org_id = self.storage.get_payment(order_id)?.org_id;
        let org_lock = self.locks.org(&org_id);
        let _org = org_lock.lock();

        let mut order = self.storage.get_payment(order_id)?;
        if self.storage.credit_marker(order_id)?.is_some() {
            self.metrics.record_duplicate_callback();
            info!(order_id, status, "Ignoring callback for credited order");
            return Ok(CallbackAck {
                order_id: order_id.to_string(),
                status: order.status,
                outcome: CallbackOutcome::Duplicate,
            });
        }

        if let Some(gross) = gross_amount {
            match Decimal::from_str(gross) {
                Ok(value) if value == Decimal::from(order.amount) => {}
                Ok(value) => warn!(
                    order_id,
                    expected = order.amount,
                    reported = %value,
                    "Gross amount differs from order, crediting stored amount"
                ),
                Err(_) => warn!(order_id, gross, "Unparseable gross amount"),
            }
        }

        order.status = status.to_string();
        order.updated_at = Utc::now();
        if let Some(raw) = raw_payload {
            order.last_notification = Some(raw.to_string());
        }

        let mut ws = self.storage.write_set();
        ws.put_payment(&order)?;

        if !is_paid(status) {
            ws.commit()?;
            info!(order_id, status, "Payment status recorded");
            return Ok(CallbackAck {
                order_id: order_id.to_string(),
                status: order.status,
                outcome: CallbackOutcome::Recorded,
            });
        }

        self.storage.get_org(&order.org_id)?;

        let mut data = BlockData::new(BlockKind::Payment, order.description.clone(), order.amount);
        data.payment_order_id = Some(order.order_id.clone());
        data.paid_by = Some(order.payer_name.clone());
        data.paid_by_uid = Some(order.payer_id.clone());

        let block = self.ledger.stage_block(&mut ws, &order.org_id, data)?;
        self.balances.stage_delta(&mut ws, &order.org_id, order.amount)?;
        ws.put_credit(&CreditMarker {
            order_id: order.order_id.clone(),
            org_id: order.org_id.clone(),
            amount: order.amount,
            block_id: block.id,
            credited_at: Utc::now(),
        })?;
        ws.commit()?;

        self.metrics.record_block_appended();
        self.metrics.record_payment_credited();
        info!(
            order_id,
            org_id = %order.org_id,
            amount = order.amount,
            "Payment credited"
        );

        Ok(CallbackAck {
            order_id: order_id.to_string(),
            status: order.status,
            outcome: CallbackOutcome::Credited {
                amount: order.amount,
                block_id: block.id,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::organization::OrgRegistry;
    use crate::payment::gateway::{CheckoutToken, MockGateway};
    use std::collections::HashSet;
    use crate::payment::signature::notification_signature;
    use crate::Config;
    use tempfile::TempDir;

    const KEY: &str = "SB-Mid-server-secret";

    struct Fixture {
        reconciler: PaymentReconciler,
        registry: OrgRegistry,
        ledger: Ledger,
        storage: Arc<Storage>,
        _temp: TempDir,
    }

    /// Sandbox gateway that refuses every checkout
    #[derive(Debug)]
    struct FailingGateway;

    #[async_trait::async_trait]
    impl PaymentGateway for FailingGateway {
        fn mode(&self) -> PaymentMode {
            PaymentMode::Sandbox
        }

        async fn create_token(&self, _request: &TokenRequest) -> Result<CheckoutToken> {
            Err(Error::Gateway("Access denied".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn setup(server_key: Option<&str>) -> Fixture {
        setup_with(server_key, Arc::new(MockGateway))
    }

    fn setup_with(server_key: Option<&str>, gateway: Arc<dyn PaymentGateway>) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.payment.server_key = server_key.map(str::to_string);

        let storage = Arc::new(Storage::open(&config).unwrap());
        let locks = Arc::new(LockRegistry::new());
        let metrics = Metrics::new().unwrap();
        let ledger = Ledger::new(storage.clone(), locks.clone(), metrics.clone());
        let reconciler = PaymentReconciler::new(
            storage.clone(),
            locks.clone(),
            ledger.clone(),
            BalanceMutator::new(storage.clone()),
            gateway,
            metrics,
            config.payment.clone(),
        );
        let registry = OrgRegistry::new(storage.clone(), locks, ledger.clone());
        Fixture {
            reconciler,
            registry,
            ledger,
            storage,
            _temp: temp_dir,
        }
    }

    fn seed_order(f: &Fixture, org_id: &str, order_id: &str, amount: i64) {
        let now = Utc::now();
        let order = PaymentOrder {
            order_id: order_id.to_string(),
            org_id: org_id.to_string(),
            payer_id: "alice".to_string(),
            payer_name: "Alice".to_string(),
            amount,
            description: "Iuran".to_string(),
            status: payment_status::PENDING.to_string(),
            mode: PaymentMode::Sandbox,
            created_at: now,
            updated_at: now,
            last_notification: None,
        };
        let mut ws = f.storage.write_set();
        ws.put_payment(&order).unwrap();
        ws.commit().unwrap();
    }

    fn notification(order_id: &str, status: &str, fraud: Option<&str>) -> GatewayNotification {
        GatewayNotification {
            order_id: order_id.to_string(),
            transaction_status: status.to_string(),
            fraud_status: fraud.map(str::to_string),
            gross_amount: "50000.00".to_string(),
            status_code: "200".to_string(),
            signature_key: Some(notification_signature(order_id, "200", "50000.00", KEY)),
        }
    }

    #[test]
    fn test_map_status() {
        assert_eq!(map_status("capture", Some("accept")), "settlement");
        assert_eq!(map_status("capture", None), "settlement");
        assert_eq!(map_status("capture", Some("challenge")), "fraud");
        assert_eq!(map_status("settlement", None), "settlement");
        assert_eq!(map_status("expire", None), "expire");
        assert!(is_paid("settlement"));
        assert!(!is_paid("fraud"));
        assert!(!is_paid("pending"));
    }

    #[tokio::test]
    async fn test_create_order_validation() {
        let f = setup(None);
        let org = f.registry.create_org("Kas", "", "alice").unwrap();

        let below = CreateOrderRequest {
            org_id: org.id.clone(),
            amount: 999,
            payer_id: "alice".to_string(),
            payer_name: None,
            payer_email: None,
            description: None,
        };
        assert!(matches!(
            f.reconciler.create_order(below).await,
            Err(Error::AmountBelowMinimum { amount: 999, minimum: 1_000 })
        ));

        let missing = CreateOrderRequest {
            org_id: "missing".to_string(),
            amount: 1_000,
            payer_id: "alice".to_string(),
            payer_name: None,
            payer_email: None,
            description: None,
        };
        assert!(matches!(
            f.reconciler.create_order(missing).await,
            Err(Error::OrgNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_order_settles_once() {
        let f = setup(None);
        let org = f.registry.create_org("Kas", "", "alice").unwrap();

        let response = f
            .reconciler
            .create_order(CreateOrderRequest {
                org_id: org.id.clone(),
                amount: 1_000,
                payer_id: "alice".to_string(),
                payer_name: Some("Alice".to_string()),
                payer_email: None,
                description: None,
            })
            .await
            .unwrap();

        assert_eq!(response.mode, PaymentMode::Mock);
        assert!(response.token.is_none());
        assert!(response.order_id.starts_with(&format!("MKG-{}-", &org.id[..6])));

        let order = f.reconciler.get_order(&response.order_id).unwrap();
        assert_eq!(order.status, "settlement");
        assert_eq!(order.description, "Iuran Kas");
        assert_eq!(f.storage.balance(&org.id).unwrap(), 1_000);

        let chain = f.ledger.get_chain(&org.id).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].data.kind, BlockKind::Payment);
        assert_eq!(chain[1].data.payment_order_id.as_deref(), Some(response.order_id.as_str()));
    }

    #[tokio::test]
    async fn test_back_to_back_orders_get_distinct_ids() {
        let f = setup(None);
        let org = f.registry.create_org("Kas", "", "alice").unwrap();

        let mut ids = HashSet::new();
        for _ in 0..5 {
            let response = f
                .reconciler
                .create_order(CreateOrderRequest {
                    org_id: org.id.clone(),
                    amount: 1_000,
                    payer_id: "alice".to_string(),
                    payer_name: None,
                    payer_email: None,
                    description: None,
                })
                .await
                .unwrap();
            ids.insert(response.order_id);
        }

        assert_eq!(ids.len(), 5);
        assert_eq!(f.reconciler.list_orders(&org.id).unwrap().len(), 5);
        assert_eq!(f.storage.balance(&org.id).unwrap(), 5_000);
    }

    #[tokio::test]
    async fn test_gateway_failure_marks_order() {
        let f = setup_with(Some(KEY), Arc::new(FailingGateway));
        let org = f.registry.create_org("Kas", "", "alice").unwrap();

        let result = f
            .reconciler
            .create_order(CreateOrderRequest {
                org_id: org.id.clone(),
                amount: 20_000,
                payer_id: "alice".to_string(),
                payer_name: None,
                payer_email: None,
                description: None,
            })
            .await;
        assert!(matches!(result, Err(Error::Gateway(_))));

        let orders = f.reconciler.list_orders(&org.id).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, payment_status::FAILURE);
        assert_eq!(f.storage.balance(&org.id).unwrap(), 0);
        assert!(f.storage.credit_marker(&orders[0].order_id).unwrap().is_none());
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let f = setup(Some(KEY));
        let org = f.registry.create_org("Kas", "", "alice").unwrap();
        seed_order(&f, &org.id, "MKG-1", 50_000);

        let mut forged = notification("MKG-1", "settlement", None);
        forged.signature_key = Some("0".repeat(128));
        assert!(matches!(
            f.reconciler.handle_notification(&forged, None),
            Err(Error::InvalidSignature(_))
        ));

        let mut unsigned = notification("MKG-1", "settlement", None);
        unsigned.signature_key = None;
        assert!(f.reconciler.handle_notification(&unsigned, None).is_err());
        assert_eq!(f.storage.balance(&org.id).unwrap(), 0);
    }

    #[test]
    fn test_redelivered_callback_credits_once() {
        let f = setup(Some(KEY));
        let org = f.registry.create_org("Kas", "", "alice").unwrap();
        seed_order(&f, &org.id, "MKG-1", 50_000);

        let raw = serde_json::to_string(&notification("MKG-1", "capture", Some("accept"))).unwrap();
        let first = f.reconciler.handle_callback(&raw).unwrap();
        assert!(matches!(first.outcome, CallbackOutcome::Credited { amount: 50_000, .. }));
        assert_eq!(first.status, "settlement");

        let second = f.reconciler.handle_callback(&raw).unwrap();
        assert_eq!(second.outcome, CallbackOutcome::Duplicate);

        // A later non-paid status cannot rewrite a credited order
        let late = serde_json::to_string(&notification("MKG-1", "expire", None)).unwrap();
        assert_eq!(
            f.reconciler.handle_callback(&late).unwrap().outcome,
            CallbackOutcome::Duplicate
        );

        assert_eq!(f.storage.balance(&org.id).unwrap(), 50_000);
        assert_eq!(f.ledger.get_chain(&org.id).unwrap().len(), 2);
        assert_eq!(f.reconciler.get_order("MKG-1").unwrap().status, "settlement");
        assert!(f.ledger.verify_chain(&org.id).unwrap().valid);
    }

    #[test]
    fn test_pending_then_settlement() {
        let f = setup(Some(KEY));
        let org = f.registry.create_org("Kas", "", "alice").unwrap();
        seed_order(&f, &org.id, "MKG-1", 50_000);

        let pending = f
            .reconciler
            .handle_notification(&notification("MKG-1", "pending", None), None)
            .unwrap();
        assert_eq!(pending.outcome, CallbackOutcome::Recorded);
        assert_eq!(f.storage.balance(&org.id).unwrap(), 0);

        let fraud = f
            .reconciler
            .handle_notification(&notification("MKG-1", "capture", Some("deny")), None)
            .unwrap();
        assert_eq!(fraud.status, "fraud");
        assert_eq!(fraud.outcome, CallbackOutcome::Recorded);

        let settled = f
            .reconciler
            .handle_notification(&notification("MKG-1", "settlement", None), None)
            .unwrap();
        assert!(matches!(settled.outcome, CallbackOutcome::Credited { .. }));
        assert_eq!(f.storage.balance(&org.id).unwrap(), 50_000);
    }

    #[test]
    fn test_unknown_order() {
        let f = setup(None);
        assert!(matches!(
            f.reconciler
                .handle_notification(&notification("MKG-missing", "settlement", None), None),
            Err(Error::PaymentNotFound(_))
        ));
        assert!(matches!(
            f.reconciler.handle_callback("not json"),
            Err(Error::Validation(_))
        ));
    }
}
