//! Streaming text-to-speech provider client.

pub mod messages;
pub mod session;

#[cfg(test)]
pub(crate) mod test_provider;

pub use session::{SynthesisEvent, SynthesisSession};
