use thiserror::Error;

/// Failure of a single call against the speech API.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TtsError {
    #[error("API returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl TtsError {
    /// Network failures, 429 and 5xx are worth another attempt; other 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            TtsError::Http { status, .. } => *status == 429 || *status >= 500,
            TtsError::Network(_) => true,
            TtsError::Cancelled | TtsError::InvalidResponse(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TtsError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TtsError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TtsError::InvalidResponse(e.to_string())
        } else {
            TtsError::Network(e.to_string())
        }
    }
}

/// Why a chunk could not be synthesized.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChunkError {
    #[error("no voice configured for character {0}")]
    MissingVoice(String),
    #[error("{source} (after {attempts} attempt(s))")]
    Synthesis {
        attempts: u32,
        #[source]
        source: TtsError,
    },
}

impl ChunkError {
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            ChunkError::Synthesis {
                source: TtsError::Cancelled,
                ..
            }
        )
    }
}

/// Error text shaped for people rather than logs.
#[derive(Debug, Clone, PartialEq)]
pub struct UserFacingError {
    pub title: String,
    pub message: String,
    pub actions: Vec<String>,
}

impl UserFacingError {
    fn new(title: &str, message: impl Into<String>, actions: &[&str]) -> Self {
        Self {
            title: title.to_string(),
            message: message.into(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for UserFacingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.title)?;
        write!(f, "{}", self.message)?;
        for action in &self.actions {
            write!(f, "\n  - {}", action)?;
        }
        Ok(())
    }
}

pub fn describe_chunk_error(error: &ChunkError) -> UserFacingError {
    match error {
        ChunkError::MissingVoice(character) => UserFacingError::new(
            "Missing Voice Configuration",
            format!("Character {} has no voice assigned.", character),
            &[
                "Assign a voice ID to this character in the project config",
                "Resume the generation afterwards",
            ],
        ),
        ChunkError::Synthesis { source, .. } => describe_tts_error(source),
    }
}

pub fn describe_tts_error(error: &TtsError) -> UserFacingError {
    match error {
        TtsError::Http { status: 401, .. } => UserFacingError::new(
            "Invalid API Key",
            "The speech API rejected the API key.",
            &[
                "Check that the API key is copied correctly",
                "Make sure the key has not been revoked",
                "Pass the key with --api-key or the ELEVENLABS_API_KEY variable",
            ],
        ),
        TtsError::Http { status: 402, .. } => quota_exceeded(),
        TtsError::Http { message, .. } if message.to_lowercase().contains("quota") => {
            quota_exceeded()
        }
        TtsError::Http { status: 429, .. } => UserFacingError::new(
            "Rate Limit Exceeded",
            "Too many requests were sent to the speech API.",
            &[
                "Wait a few minutes and resume",
                "Increase the delay between requests",
            ],
        ),
        TtsError::Http { status, message } if *status >= 500 => UserFacingError::new(
            "Service Unavailable",
            format!("The speech API is having trouble (HTTP {}): {}", status, message),
            &["Resume the generation later"],
        ),
        TtsError::Http { status, message } => UserFacingError::new(
            "Request Rejected",
            format!("The speech API refused the request (HTTP {}): {}", status, message),
            &[
                "Check the voice ID and model settings for this character",
                "Shorten or rephrase the line if it is unusually long",
            ],
        ),
        TtsError::Network(detail) => UserFacingError::new(
            "Network Error",
            format!("Could not reach the speech API: {}", detail),
            &["Check your internet connection", "Resume the generation"],
        ),
        TtsError::Cancelled => UserFacingError::new(
            "Generation Cancelled",
            "The generation was stopped before it finished.",
            &["Start the generation again to continue"],
        ),
        TtsError::InvalidResponse(detail) => UserFacingError::new(
            "Unexpected Response",
            format!("The speech API returned data that could not be read: {}", detail),
            &["Resume the generation", "Try a different output format"],
        ),
    }
}

pub fn describe_validation_errors(errors: &[String]) -> UserFacingError {
    UserFacingError {
        title: "Configuration Incomplete".to_string(),
        message: errors.join("\n"),
        actions: vec![
            "Fix the listed problems in the project config".to_string(),
            "Run the generation again".to_string(),
        ],
    }
}

fn quota_exceeded() -> UserFacingError {
    UserFacingError::new(
        "Quota Exceeded",
        "Your account does not have enough character quota left.",
        &[
            "Check the remaining quota on your account",
            "Upgrade the plan or wait for the quota to reset",
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let http = |status| TtsError::Http {
            status,
            message: String::new(),
        };
        assert!(http(500).is_retryable());
        assert!(http(503).is_retryable());
        assert!(http(429).is_retryable());
        assert!(!http(400).is_retryable());
        assert!(!http(401).is_retryable());
        assert!(!http(404).is_retryable());
        assert!(TtsError::Network("reset".into()).is_retryable());
        assert!(!TtsError::Cancelled.is_retryable());
    }

    #[test]
    fn test_describe_errors() {
        let unauthorized = ChunkError::Synthesis {
            attempts: 1,
            source: TtsError::Http {
                status: 401,
                message: "invalid_api_key".into(),
            },
        };
        let described = describe_chunk_error(&unauthorized);
        assert_eq!(described.title, "Invalid API Key");
        assert!(!described.actions.is_empty());

        let quota = TtsError::Http {
            status: 400,
            message: "quota_exceeded".into(),
        };
        assert_eq!(describe_tts_error(&quota).title, "Quota Exceeded");

        let missing = describe_chunk_error(&ChunkError::MissingVoice("JANE".into()));
        assert!(missing.message.contains("JANE"));
        assert!(missing.to_string().starts_with("Missing Voice Configuration\n"));
    }

    #[test]
    fn test_cancellation_detection() {
        let cancelled = ChunkError::Synthesis {
            attempts: 1,
            source: TtsError::Cancelled,
        };
        assert!(cancelled.is_cancellation());
        assert!(!ChunkError::MissingVoice("A".into()).is_cancellation());
    }
}
