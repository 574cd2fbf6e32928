pub mod runtime;
pub mod state;
pub mod traits;

pub use runtime::AgentRuntime;
pub use state::{AgentState, AgentStatus};
pub use traits::{AgentContext, MessageHandler, Outbound};
