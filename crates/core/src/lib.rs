//! # tapeloop core
//!
//! Domain types, traits, and error definitions for the tapeloop agent engine.
//! This crate has **zero framework dependencies**; it defines the domain model
//! that the tape, tool, and agent crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator at the edge of the engine (model backends, tools, inbound
//! channels) is a trait or a validated value type here. Implementations live
//! in their respective crates, and tests swap in scripted doubles.

pub mod error;
pub mod message;
pub mod provider;
pub mod envelope;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{EnvelopeError, Error, ProviderError, Result, TapeError, ToolError};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
pub use envelope::Envelope;
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult};
