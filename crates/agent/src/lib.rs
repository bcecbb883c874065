//! The tapeloop agent — routing, execution, and the background model loop.
//!
//! Every turn flows through the same pipeline:
//!
//! 1. **Parse** the raw text into prose and `$name ...` action segments
//! 2. **Execute** each action (built-in tool or OS shell) and record it on the tape
//! 3. **Route**: a pure command turn returns directly; anything else becomes
//!    model input
//! 4. **Loop**: a background worker calls the model, runs the actions in its
//!    reply, and feeds their results back until the model answers in prose
//!
//! The loop stops on a plain answer, `$done`, `$quit`, the step budget, or
//! when its follow-ups stop producing new information.

pub mod command;
pub mod loop_runner;
pub mod model_runner;
pub mod provider;
pub mod runtime;
pub mod segments;
pub mod session;

pub use command::{ActionOutcome, Origin, OutcomeStatus};
pub use loop_runner::{AgentLoop, LoopReport, LoopSettings, LoopStatus, Submission};
pub use model_runner::{ModelRunner, ModelSettings};
pub use provider::{EchoProvider, provider_for};
#[cfg(any(test, feature = "test-util"))]
pub use provider::ScriptedProvider;
pub use runtime::{DEFAULT_SESSION, Runtime, SessionHandle, TurnOutcome};
pub use segments::{ActionKind, ActionSegment, Segment, parse_segments};
pub use session::{AssistantResult, RouteResult, Session};
