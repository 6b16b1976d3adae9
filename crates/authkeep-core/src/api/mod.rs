//! Network collaborator for the authentication endpoints.
//!
//! This module provides the `AuthBackend` trait the token lifecycle depends
//! on, and `HttpAuthBackend`, its reqwest implementation for:
//! - `POST /auth/refresh` and `POST /auth/login` (token grants)
//! - `POST /auth/logout` (best-effort server-side revocation)
//! - `GET /auth/me` (session probe)
//!
//! Authenticated requests use bearer tokens; see [`auth_headers`].

pub mod backend;
pub mod client;
pub mod error;

pub use backend::{AuthBackend, DeviceRegistry, TokenGrant, UserProfile};
pub use client::{auth_headers, HttpAuthBackend};
pub use error::ApiError;
