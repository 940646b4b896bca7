use crate::error::RagError;
use reqwest::Client;
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1_536;
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o";

/// Connection settings shared by the embedding and chat providers.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub chat_model: String,
    pub request_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        let mut config = Self {
            api_key: non_empty_env("OPENAI_API_KEY"),
            ..Self::default()
        };
        if let Some(base_url) = non_empty_env("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        config
    }

    pub fn validate(&self) -> Result<(), RagError> {
        self.api_key()?;
        self.endpoint("")?;
        Ok(())
    }

    pub fn api_key(&self) -> Result<&str, RagError> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| RagError::Configuration("OPENAI_API_KEY is not set".to_string()))
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, RagError> {
        let joined = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        Url::parse(&joined).map_err(|error| {
            RagError::Configuration(format!("invalid provider url {joined}: {error}"))
        })
    }

    pub fn http_client(&self) -> Result<Client, RagError> {
        Ok(Client::builder().timeout(self.request_timeout).build()?)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let value = value.trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_a_configuration_error() {
        let config = ProviderConfig {
            api_key: Some("   ".to_string()),
            ..ProviderConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RagError::Configuration(_))
        ));
    }

    #[test]
    fn endpoint_keeps_the_base_path() -> Result<(), RagError> {
        let config = ProviderConfig {
            base_url: "http://localhost:11434/v1/".to_string(),
            ..ProviderConfig::default()
        };
        assert_eq!(
            config.endpoint("embeddings")?.as_str(),
            "http://localhost:11434/v1/embeddings"
        );
        Ok(())
    }

    #[test]
    fn unparsable_base_url_is_rejected() {
        let config = ProviderConfig {
            api_key: Some("sk-test".to_string()),
            base_url: "not a url".to_string(),
            ..ProviderConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RagError::Configuration(_))
        ));
    }
}
