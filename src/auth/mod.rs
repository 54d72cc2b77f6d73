//! Authentication and authorization: bearer-token validation, JWKS caching,
//! and email-allow-list role derivation.

pub mod jwks;
pub mod models;
pub mod roles;
pub mod service;

pub use jwks::JwksCache;
pub use models::{AuthenticatedUser, Permissions, UserRole};
pub use roles::RoleManager;
pub use service::AuthService;
