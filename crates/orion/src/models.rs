//! These models represent the objects passed around by the agent
//!
//! There are several different related formats we need to interact with:
//! - chat completion messages/tools, sent from the agent to turn-style backends
//! - response items/tools, sent from the agent to event-stream backends
//! - anthropic messages/tools, sent from the agent to the LLM
//! - tool requests and results, exchanged with local and remote tools
//!
//! These all overlap to varying degrees. We always immediately convert those data models
//! into the internal structs using to/from helpers. Because of the need for compatibility,
//! the internal models are not an exact match to any of these formats.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
