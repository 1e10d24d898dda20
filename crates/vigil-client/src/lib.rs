pub mod transport;

pub use transport::{DEFAULT_MAX_BODY_BYTES, ReqwestTransport};
