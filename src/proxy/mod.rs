//! Intercepting proxy module
//!
//! Accepts plaintext HTTP or CONNECT-tunnelled TLS, decrypts with minted
//! per-host certificates, relays to the origin, and captures every
//! exchange.

pub mod codec;
mod server;
mod tls;

pub use server::ProxyServer;
pub use tls::CertificateAuthority;
