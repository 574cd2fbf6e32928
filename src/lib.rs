#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::doc_markdown,
    clippy::float_cmp,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self
)]

//! In-process message bus and cooperative agent runtime.
//!
//! Agents exchange [`Message`]s through a shared [`MessageBus`] with bounded
//! priority inboxes and correlation-id request/response. [`AgentRuntime`]
//! drives a [`MessageHandler`] with a receive loop and heartbeat, the
//! [`DeadlockDetector`] flags agents that stop making progress, and an
//! [`EventSink`] records everything that happens. [`Swarm`] wires the pieces
//! together.

pub mod agent;
pub mod bus;
pub mod config;
pub mod deadlock;
pub mod error;
pub mod observability;
pub mod swarm;

pub use agent::{AgentContext, AgentRuntime, AgentState, AgentStatus, MessageHandler, Outbound};
pub use bus::{BusStats, Message, MessageBus, Payload, Priority};
pub use config::Config;
pub use deadlock::{DeadlockDetector, DeadlockReport};
pub use error::{Result, SwarmError};
pub use observability::{EventSink, SessionLogger, SwarmEvent};
pub use swarm::{Swarm, SwarmHealth};
