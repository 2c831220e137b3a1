//! Provider tags for stored credentials.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The enumerated set of third-party providers a credential can belong to.
///
/// `Custom` covers everything else, including the bridge's own chat session
/// token, which is stored as an ordinary credential with additional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI API keys.
    OpenAi,
    /// Anthropic API keys.
    Anthropic,
    /// OpenRouter API keys.
    OpenRouter,
    /// Google AI API keys.
    Google,
    /// xAI API keys.
    Xai,
    /// Anything else.
    Custom,
}

impl Provider {
    /// All known provider tags, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::OpenAi,
        Self::Anthropic,
        Self::OpenRouter,
        Self::Google,
        Self::Xai,
        Self::Custom,
    ];

    /// The canonical lowercase wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::OpenRouter => "openrouter",
            Self::Google => "google",
            Self::Xai => "xai",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "openrouter" => Ok(Self::OpenRouter),
            "google" => Ok(Self::Google),
            "xai" => Ok(Self::Xai),
            "custom" => Ok(Self::Custom),
            other => Err(UnknownProvider(other.to_owned())),
        }
    }
}

/// Error returned when parsing an unrecognized provider tag.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown provider tag: {0}")]
pub struct UnknownProvider(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_roundtrip() {
        for p in Provider::ALL {
            let parsed: Provider = p.as_str().parse().unwrap();
            assert_eq!(p, parsed);
        }
    }

    #[test]
    fn test_provider_serde_lowercase() {
        let json = serde_json::to_string(&Provider::OpenRouter).unwrap();
        assert_eq!(json, "\"openrouter\"");
        let back: Provider = serde_json::from_str("\"xai\"").unwrap();
        assert_eq!(back, Provider::Xai);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = "aws".parse::<Provider>().unwrap_err();
        assert!(err.to_string().contains("aws"));
    }
}
