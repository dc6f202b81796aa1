//! Realtime WebSocket Adapter
//!
//! Implements [`ChangeStreamPort`](crate::application::ports::ChangeStreamPort)
//! over the Phoenix channel protocol used by Supabase Realtime:
//!
//! - **messages**: Frame envelopes, join payloads, inbound classification
//! - **heartbeat**: Socket keep-alive on the `phoenix` topic
//! - **client**: One socket and session task per channel

pub mod client;
pub mod heartbeat;
pub mod messages;

pub use client::{PhoenixChangeStream, PhoenixClientError, PhoenixConfig};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use messages::{InboundEvent, PhoenixMessage, PostgresChange};
