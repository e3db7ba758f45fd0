//! Authentication for the burrow management API

pub mod jwt;

pub use jwt::{permissions, JwtClaims, JwtError, JwtValidator};
