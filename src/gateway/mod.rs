pub mod client;
pub mod signature;
pub mod webhook;

pub use client::{HttpGateway, PaymentGateway};
pub use webhook::WebhookProcessor;
