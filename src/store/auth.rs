use async_trait::async_trait;

use crate::engine::error::CaseError;

/// Tokens identifying the system user and the calling service.
#[derive(Clone)]
pub struct SystemCredentials {
    pub user_token: String,
    pub service_token: String,
}

impl std::fmt::Debug for SystemCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemCredentials")
            .field("user_token", &"<redacted>")
            .field("service_token", &"<redacted>")
            .finish()
    }
}

/// Source of system credentials. Called once at the start of every run.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn acquire(&self) -> Result<SystemCredentials, CaseError>;
}

/// Fixed credentials, for tests and local simulation.
pub struct StaticCredentials(pub SystemCredentials);

impl StaticCredentials {
    pub fn new(user_token: &str, service_token: &str) -> Self {
        Self(SystemCredentials {
            user_token: user_token.to_string(),
            service_token: service_token.to_string(),
        })
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn acquire(&self) -> Result<SystemCredentials, CaseError> {
        Ok(self.0.clone())
    }
}

/// Reads `CASEFLOW_SYSTEM_TOKEN` and `CASEFLOW_SERVICE_TOKEN` on every call,
/// so rotated tokens are picked up by the next run.
pub struct EnvCredentials;

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn acquire(&self) -> Result<SystemCredentials, CaseError> {
        let read = |key: &str| required_token(key, std::env::var(key).ok());
        Ok(SystemCredentials {
            user_token: read("CASEFLOW_SYSTEM_TOKEN")?,
            service_token: read("CASEFLOW_SERVICE_TOKEN")?,
        })
    }
}

fn required_token(key: &str, value: Option<String>) -> Result<String, CaseError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CaseError::Credentials(format!("{} is not set", key)))
}
