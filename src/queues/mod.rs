//! Hand-over points between the engines. Each engine owns a `Wakeup` that producers signal
//!  after adding work, and that the engine waits on (together with its next deadline) when it
//!  is idle.

pub mod wakeup;
pub mod engine_queue;
pub mod ack_queue;
pub mod resend_queue;
pub mod confirmation_queue;
pub mod bundling_queue;
