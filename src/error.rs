use thiserror::Error;

#[derive(Debug, Error)]
pub enum HaloError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("device backend error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, HaloError>;
