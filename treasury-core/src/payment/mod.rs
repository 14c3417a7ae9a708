//! Deposits through an external payment gateway

pub mod gateway;
pub mod reconciler;
pub mod signature;

pub use gateway::{gateway_for, CheckoutToken, MockGateway, PaymentGateway, SnapGateway, TokenRequest};
pub use reconciler::{
    is_paid, map_status, CallbackAck, CallbackOutcome, CreateOrderRequest, CreateOrderResponse,
    GatewayNotification, PaymentReconciler,
};
pub use signature::{notification_signature, verify_signature};
