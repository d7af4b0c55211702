//! LearnHub Auth - authentication and session tokens for the learning platform
//!
//! Password login, short-lived signed access tokens, long-lived opaque
//! refresh tokens, and the HTTP surface that exposes them.

pub mod app;
pub mod core;
