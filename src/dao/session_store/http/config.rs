use super::error::{HttpDaoError, HttpResult};

/// Runtime configuration describing how to reach a session store server.
#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    pub base_url: String,
}

impl HttpStoreConfig {
    /// Construct a configuration from an explicit base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Build a configuration by reading `STORE_URL`.
    pub fn from_env() -> HttpResult<Self> {
        let base_url = std::env::var("STORE_URL")
            .map_err(|_| HttpDaoError::MissingEnvVar { var: "STORE_URL" })?;
        Ok(Self::new(base_url))
    }
}
