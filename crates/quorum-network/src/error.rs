use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Frame too short")]
    FrameTooShort,

    #[error("Frame exceeds size limit: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message code {0}")]
    UnknownCode(u8),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Handler panicked")]
    HandlerPanic,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

impl From<rmp_serde::encode::Error> for NetworkError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        NetworkError::MalformedPayload(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for NetworkError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        NetworkError::MalformedPayload(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
