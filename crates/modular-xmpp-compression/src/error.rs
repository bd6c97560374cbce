use modular_xmpp_fsm::FilterError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("deflate failed: {0}")]
    Compress(#[from] flate2::CompressError),

    #[error("inflate failed: {0}")]
    Decompress(#[from] flate2::DecompressError),

    #[error("filter is closed")]
    Closed,
}

impl CompressionError {
    /// Report this error as a failure of the named filter.
    pub fn into_filter_error(self, filter: &str) -> FilterError {
        FilterError::Transform {
            filter: filter.to_owned(),
            reason: self.to_string(),
        }
    }
}
