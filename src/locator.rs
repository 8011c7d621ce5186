//! Decoding of the resource locators accepted by the HTTP handlers.
//!
//! `/pic` carries the origin URL base64-encoded with a private alphabet so
//! that the link survives query-string mangling; `/job` takes plain URLs.

use base64::alphabet::Alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use url::Url;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LocatorError {
    #[error("missing url parameter")]
    Missing,

    #[error("invalid url alphabet: {0}")]
    Alphabet(String),

    #[error("url parameter is not valid base64: {0}")]
    Decode(String),

    #[error("url is not valid utf-8")]
    Utf8,

    #[error("unsupported url {0:?}")]
    Unsupported(String),
}

#[derive(Clone)]
pub struct Codec {
    engine: Option<GeneralPurpose>,
}

impl Codec {
    /// `None` disables decoding and takes the parameter as a plain URL.
    pub fn new(alphabet: Option<&str>) -> Result<Self, LocatorError> {
        let Some(alphabet) = alphabet else {
            return Ok(Self { engine: None });
        };
        let alphabet =
            Alphabet::new(alphabet).map_err(|err| LocatorError::Alphabet(err.to_string()))?;
        let config = GeneralPurposeConfig::new()
            .with_encode_padding(true)
            .with_decode_padding_mode(DecodePaddingMode::Indifferent);
        Ok(Self {
            engine: Some(GeneralPurpose::new(&alphabet, config)),
        })
    }

    pub fn decode(&self, raw: &str) -> Result<String, LocatorError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(LocatorError::Missing);
        }
        let decoded = match &self.engine {
            Some(engine) => {
                let bytes = engine
                    .decode(raw)
                    .map_err(|err| LocatorError::Decode(err.to_string()))?;
                String::from_utf8(bytes).map_err(|_| LocatorError::Utf8)?
            }
            None => raw.to_string(),
        };
        normalize(&decoded)
    }

    pub fn encode(&self, url: &str) -> String {
        match &self.engine {
            Some(engine) => engine.encode(url.as_bytes()),
            None => url.to_string(),
        }
    }
}

/// Trims trailing NUL padding and checks the URL is fetchable over http(s).
pub fn normalize(raw: &str) -> Result<String, LocatorError> {
    let trimmed = raw.trim_end_matches('\0');
    if trimmed.is_empty() {
        return Err(LocatorError::Missing);
    }
    let parsed = Url::parse(trimmed).map_err(|_| LocatorError::Unsupported(trimmed.to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(trimmed.to_string()),
        _ => Err(LocatorError::Unsupported(trimmed.to_string())),
    }
}
