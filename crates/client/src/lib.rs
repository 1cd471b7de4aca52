//! Platewise Client
//!
//! A reconnecting WebSocket supervisor for talking to a Platewise server.

pub mod message;
pub mod policy;
pub mod supervisor;

pub use message::{parse_frame, FrameKind, ReceivedMessage};
pub use policy::{ReconnectPolicy, RetryState};
pub use supervisor::{ClientError, ConnectionSupervisor, MessageCallback};
