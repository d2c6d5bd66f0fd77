//! Model transport: the chat-completions client plus the bounded backoff
//! retry wrapper applied to every model call.

pub mod backoff;
pub mod client;
