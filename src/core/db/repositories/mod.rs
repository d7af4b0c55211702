//! Database repositories for LearnHub Auth
//!
//! Each store is a trait the auth core consumes, with a PostgreSQL
//! implementation and an in-memory one.

pub mod memory;
pub mod refresh_token;
pub mod user;

pub use memory::{InMemoryPrincipalStore, InMemoryRefreshTokenStore};
pub use refresh_token::{
    RefreshTokenRepository, RefreshTokenRepositoryError, RefreshTokenStore, hash_token,
};
pub use user::{PrincipalStore, UserRepository, UserRepositoryError};
