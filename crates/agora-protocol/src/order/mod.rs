//! Signed limit orders: identifiers, the wire envelope, the lifecycle service.

mod service;
mod types;
mod wire;

pub use service::{BroadcastReport, FrameSink, OrderService, ReceiveOutcome};
pub use types::{order_id, verify_order, CreateRequest, Order, OrderId, OrderState};
pub use wire::{Operation, WireMessage};
