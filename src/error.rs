use thiserror::Error;

/// Failures of a call to the model service. Malformed classification replies
/// are not errors: they are recovered with defaults by
/// [`crate::diagnosis::AnalysisResult::from_reply`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no API key configured (set GEMINI_API_KEY)")]
    MissingApiKey,

    #[error("request to model service failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("model service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model service reported an error: {0}")]
    Api(String),

    #[error("failed to decode model service response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Reasons an uploaded image could not be taken in.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("expected a data URL of the form data:<mime>;base64,<payload>")]
    NotDataUrl,

    #[error("image payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unsupported image type: {0}")]
    UnsupportedType(String),

    #[error("image is empty")]
    Empty,

    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
}
