pub mod chat;
pub mod completion;
pub mod models;
pub mod sse;
