//! Network seam: buffered request/response values, the transport trait
//! and the credentials applied at send time.

pub mod client;
pub mod identity;
pub mod types;

pub use client::{ReqwestTransport, Transport, TransportError};
pub use identity::{Identity, NoIdentity, TokenIdentity};
pub use types::{normalize_headers, CapturedResponse, HttpRequest};
