//! Engine assembly
//!
//! # Example
//!
//! ```no_run
//! use treasury_core::{Config, Treasury};
//!
//! fn main() -> treasury_core::Result<()> {
//!     let treasury = Treasury::open(Config::from_env()?)?;
//!
//!     let org = treasury.orgs().create_org("Kas RT 05", "", "alice")?;
//!     let audit = treasury.ledger().verify_chain(&org.id)?;
//!     assert!(audit.valid);
//!     Ok(())
//! }
//! ```

use crate::{
    balance::BalanceMutator,
    deletion::OrgDeletion,
    governance::ProposalMachine,
    ledger::Ledger,
    locks::LockRegistry,
    metrics::Metrics,
    organization::OrgRegistry,
    payment::{gateway_for, PaymentGateway, PaymentReconciler},
    payout::{connector_for, PayoutConnector, PayoutDispatcher},
    scheduler::SweepScheduler,
    storage::Storage,
    Config, Error, Result,
};
use std::sync::Arc;
use std::time::Duration;

/// Treasury ledger and governance engine
#[derive(Debug, Clone)]
pub struct Treasury {
    config: Config,
    storage: Arc<Storage>,
    locks: Arc<LockRegistry>,
    metrics: Metrics,
    ledger: Ledger,
    balances: BalanceMutator,
    orgs: OrgRegistry,
    deletion: OrgDeletion,
    proposals: ProposalMachine,
    payments: PaymentReconciler,
    payouts: PayoutDispatcher,
}

impl Treasury {
    /// Open the store and wire every component
    ///
    /// Gateway and payout provider follow the configured keys (mock
    /// without them).
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()
            .map_err(|e| Error::Other(format!("Failed to create metrics: {}", e)))?;
        let gateway = gateway_for(&config.payment)?;
        let connector = connector_for(&config.payout)?;

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            payment_mode = gateway.mode().as_str(),
            payout_connector = connector.name(),
            "Treasury engine opened"
        );

        Ok(Self::assemble(config, storage, metrics, gateway, connector))
    }

    fn assemble(
        config: Config,
        storage: Arc<Storage>,
        metrics: Metrics,
        gateway: Arc<dyn PaymentGateway>,
        connector: Arc<dyn PayoutConnector>,
    ) -> Self {
        let locks = Arc::new(LockRegistry::new());
        let ledger = Ledger::new(storage.clone(), locks.clone(), metrics.clone());
        let balances = BalanceMutator::new(storage.clone());
        let orgs = OrgRegistry::new(storage.clone(), locks.clone(), ledger.clone());
        let deletion = OrgDeletion::new(storage.clone(), locks.clone());
        let proposals = ProposalMachine::new(
            storage.clone(),
            locks.clone(),
            ledger.clone(),
            balances.clone(),
            deletion.clone(),
            metrics.clone(),
            config.governance.clone(),
        );
        let payments = PaymentReconciler::new(
            storage.clone(),
            locks.clone(),
            ledger.clone(),
            balances.clone(),
            gateway,
            metrics.clone(),
            config.payment.clone(),
        );
        let payouts = PayoutDispatcher::new(proposals.clone(), connector);

        Self {
            config,
            storage,
            locks,
            metrics,
            ledger,
            balances,
            orgs,
            deletion,
            proposals,
            payments,
            payouts,
        }
    }

    /// Replace the payment gateway
    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.payments = PaymentReconciler::new(
            self.storage.clone(),
            self.locks.clone(),
            self.ledger.clone(),
            self.balances.clone(),
            gateway,
            self.metrics.clone(),
            self.config.payment.clone(),
        );
        self
    }

    /// Replace the payout provider
    pub fn with_payout_connector(mut self, connector: Arc<dyn PayoutConnector>) -> Self {
        self.payouts = PayoutDispatcher::new(self.proposals.clone(), connector);
        self
    }

    /// Hash-chain ledger
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Balance mutator
    pub fn balances(&self) -> &BalanceMutator {
        &self.balances
    }

    /// Organization registry
    pub fn orgs(&self) -> &OrgRegistry {
        &self.orgs
    }

    /// Proposal state machine
    pub fn proposals(&self) -> &ProposalMachine {
        &self.proposals
    }

    /// Deletion saga
    pub fn deletion(&self) -> &OrgDeletion {
        &self.deletion
    }

    /// Payment reconciler
    pub fn payments(&self) -> &PaymentReconciler {
        &self.payments
    }

    /// Payout dispatcher
    pub fn payouts(&self) -> &PayoutDispatcher {
        &self.payouts
    }

    /// Deadline sweep over this engine
    pub fn scheduler(&self) -> SweepScheduler {
        SweepScheduler::new(
            self.storage.clone(),
            self.proposals.clone(),
            self.deletion.clone(),
            self.metrics.clone(),
            Duration::from_secs(self.config.scheduler.sweep_interval_secs),
        )
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}
