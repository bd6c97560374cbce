//! XEP-0138 stream compression for modular XMPP connections.
//!
//! [`CompressionModuleDescriptor`] adds a `Compression` state between
//! `AuthenticatedButUnbound` and resource binding. When the server offers
//! zlib and compression is enabled in the configuration, the state
//! negotiates it, installs a [`ZlibFilter`] at the head of the filter
//! chain and restarts the stream.

pub mod error;
pub mod filter;
pub mod module;

pub use error::CompressionError;
pub use filter::ZlibFilter;
pub use module::{
    CompressionModule, CompressionModuleDescriptor, CompressionState, COMPRESSION,
    COMPRESS_FEATURE_NAMESPACE, COMPRESS_NAMESPACE, ZLIB,
};
