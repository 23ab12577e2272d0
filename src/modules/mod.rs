//! Built-in module implementations.
//!
//! Each module lives in its own file together with its manifest handler;
//! `ManifestRegistry::builtin` wires them all up.

pub mod audit;
pub mod auth_oidc;
pub mod cookie;
pub mod custom_headers;
pub mod enrichment;
pub mod rewriter;
pub mod session;

pub use audit::AuditModule;
pub use auth_oidc::AuthOidcModule;
pub use cookie::CookieModule;
pub use custom_headers::CustomHeadersModule;
pub use enrichment::EnrichmentModule;
pub use rewriter::RewriterModule;
pub use session::SessionModule;
