pub mod verifier;
pub mod wrap;

pub use verifier::{create_client_config, TlsLegs};
