//! Interceptor - rotating, capturing reverse proxy for chat-completion APIs
//!
//! Sits between an OpenAI-compatible client and an upstream API, rotates
//! credentials and models on failure, and records every request/response
//! pair (streamed or buffered) for observers.

pub mod admin;
pub mod config;
pub mod error;
pub mod proxy;
pub mod testing;

pub use error::InterceptorError;
