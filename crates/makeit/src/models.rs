//! These models represent the objects passed around during a conversational turn
//!
//! There are several related formats we need to interact with:
//! - turn requests and session reads, exchanged with the HTTP surface
//! - chat-completion messages/tools, sent from the controller to the model endpoint
//! - history entries and session/user items, persisted in the key-value store
//! - tool calls, sent from the controller to the toolboxes
//!
//! We always immediately convert those formats into the internal structs using
//! to/from helpers, so the internal models are not an exact match to any of them.
pub mod content;
pub mod message;
pub mod role;
pub mod session;
pub mod tool;
