use std::collections::TryReserveError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SBufferError {
    #[error("failed to allocate buffer node: {0}")]
    Allocation(#[from] TryReserveError),
}
