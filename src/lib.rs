//! Signaling transport and call-session negotiation for one-to-one tutoring
//! calls.
//!
//! Media flows peer-to-peer; the relay only carries signaling. The crate is
//! organised bottom-up: [`signaling`] owns the relay channel, [`peer`] owns a
//! single WebRTC session (with the candidate ordering buffer), and [`call`]
//! coordinates the call lifecycle on top of both.

pub mod call;
pub mod config;
pub mod media;
pub mod peer;
pub mod protocol;
pub mod signaling;
pub mod telemetry;

pub use call::{CallEngine, CallEvent, CallPhase, CallState};
pub use config::CallConfig;
pub use signaling::{LinkState, SignalingChannel};
