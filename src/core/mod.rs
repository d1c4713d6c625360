pub mod chat_stream;
pub mod classify;
pub mod config;
pub mod message;
pub mod panel;
pub mod persistence;
pub mod request;
pub mod session;
