use thiserror::Error;

use crate::settings::FxKind;

/// Errors surfaced to callers of the lab.
///
/// DSP-path problems never show up here: they degrade to a lower quality
/// output instead. What remains is bad input, decoding and encoding.
#[derive(Debug, Error)]
pub enum LabError {
    /// Source buffer violates the input contract.
    #[error("Invalid source buffer: {0}")]
    InvalidSource(String),

    /// The same effect module was listed twice in `fxOrder`.
    #[error("Duplicate effect module in fxOrder: {0}")]
    DuplicateModule(FxKind),

    /// Settings JSON could not be parsed.
    #[error("Invalid settings: {0}")]
    Settings(#[from] serde_json::Error),

    /// Audio bytes could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Remote fetch returned a non-success status.
    #[error("Fetch failed with HTTP status {0}")]
    FetchStatus(u16),

    /// Transport-level fetch failure.
    #[cfg(feature = "fetch")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Rendered buffer does not fit a RIFF container.
    #[error("Buffer too large to encode as WAV ({0} data bytes)")]
    EncodeOverflow(usize),
}

pub type Result<T> = std::result::Result<T, LabError>;

impl From<hound::Error> for LabError {
    fn from(e: hound::Error) -> Self {
        LabError::Decode(e.to_string())
    }
}
