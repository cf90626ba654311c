//! Signed, best-effort callbacks for terminal jobs.

pub mod delivery;
pub mod signing;

pub use delivery::{CallbackDispatcher, CallbackPayload, CallbackPolicy, DeliveryOutcome};
pub use signing::{SignatureError, sign, verify};
