//! Agent implementations
//!
//! Only an OpenAI-compatible chat-completions backend ships in-tree; anything
//! else plugs in through the [`crate::Agent`] trait.

pub mod openai_compat;
pub mod types;

pub use openai_compat::{OpenAiCompatAgent, OpenAiCompatConfig};
pub use types::{ChatMessage, ChatRole};
