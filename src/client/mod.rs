//! Viewstamp's client functionality modules.

mod apistub;
mod endpoint;

/// Client stub ID type.
pub type ClientId = u64;

pub use apistub::ClientApiStub;
pub use endpoint::{ClientConfig, ClientEndpoint};
