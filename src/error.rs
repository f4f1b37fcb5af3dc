use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrambleError>;

#[derive(Debug, Error)]
pub enum BrambleError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("incompatible file: {0}")]
    Incompatible(String),
    #[error("input too large: {0}")]
    InputTooLarge(String),
    #[error("page {0} is free or does not exist")]
    NotAllocated(u32),
    #[error("page {0} is already free")]
    AlreadyFree(u32),
    #[error("page data is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("corrupt format: {0}")]
    Corrupt(String),
}
