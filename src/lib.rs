//! Parley is a streaming chat session core with a minimal line-mode
//! client for remote LLM APIs.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the transcript store, the per-panel session state
//!   machine, request building, failure classification, and the
//!   streaming transport that feeds them.
//! - [`auth`] defines the provider set and the API key resolution
//!   chain (runtime key, profile key table, system vault).
//! - [`api`] defines the chat completion payloads spoken to every
//!   provider over the OpenAI-compatible shape.
//! - [`utils`] holds small shared helpers.
//!
//! The runtime entrypoint lives in the binary crate (`src/main.rs`),
//! which wires a [`core::panel::ChatPanel`] to stdin/stdout.

pub mod api;
pub mod auth;
pub mod core;
pub mod utils;
