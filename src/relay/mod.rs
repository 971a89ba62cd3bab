//! The streaming relay: event channel, conversation history and the session
//! orchestrator that ties inference and synthesis together.

pub mod channel;
pub mod conversation;
pub mod orchestrator;

pub use channel::{ClientEvent, EventChannel};
pub use conversation::ConversationState;
pub use orchestrator::Orchestrator;
