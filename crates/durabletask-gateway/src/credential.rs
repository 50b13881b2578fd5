//! Credential providers.
//!
//! The gateway never resolves identities itself. Engines and the management
//! client ask a [`CredentialProvider`] for a bearer token for a given scope;
//! the mechanism is chosen by configuration and named in the connection string.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::UpstreamError;

/// Scope requested for task hub data-plane calls.
pub const ENGINE_SCOPE: &str = "https://durabletask.io/.default";

/// Scope requested for Azure Resource Manager calls.
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

/// Environment variables read by [`EnvironmentCredential`], in order.
pub const ENV_ACCESS_TOKEN: &str = "DURABLETASK_ACCESS_TOKEN";
pub const ENV_AZURE_ACCESS_TOKEN: &str = "AZURE_ACCESS_TOKEN";

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const REFRESH_MARGIN_SECS: i64 = 300;
/// How long a token without a reported expiry is reused.
const UNKNOWN_EXPIRY_TTL_SECS: i64 = 120;

/// How a client authenticates against the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum AuthMechanism {
    /// Environment token, then Azure CLI, then managed identity.
    #[default]
    DefaultAzure,
    ManagedIdentity,
    AzureCli,
    Environment,
    /// No authentication (local emulator).
    None,
}

impl AuthMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DefaultAzure => "DefaultAzure",
            Self::ManagedIdentity => "ManagedIdentity",
            Self::AzureCli => "AzureCli",
            Self::Environment => "Environment",
            Self::None => "None",
        }
    }

    pub fn requires_token(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMechanism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "defaultazure" | "default" => Ok(Self::DefaultAzure),
            "managedidentity" => Ok(Self::ManagedIdentity),
            "azurecli" | "cli" => Ok(Self::AzureCli),
            "environment" | "env" => Ok(Self::Environment),
            "none" => Ok(Self::None),
            other => Err(format!("unknown authentication mechanism '{other}'")),
        }
    }
}

impl TryFrom<String> for AuthMechanism {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A bearer token and its expiry, when known.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: Option<DateTime<Utc>>) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    /// Whether the token is still usable `margin` from now. A token with no
    /// known expiry is never fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_on.is_some_and(|expiry| expiry - margin > now)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Source of bearer tokens.
#[async_trait]
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    /// Obtain a token for `scope`.
    async fn get_token(&self, scope: &str) -> Result<AccessToken, UpstreamError>;

    /// The mechanism this provider implements.
    fn mechanism(&self) -> AuthMechanism;
}

/// Build the provider for a mechanism, wrapped in a token cache.
pub fn from_mechanism(
    mechanism: AuthMechanism,
    http: reqwest::Client,
) -> Arc<dyn CredentialProvider> {
    match mechanism {
        AuthMechanism::None => Arc::new(AnonymousCredential),
        AuthMechanism::Environment => Arc::new(EnvironmentCredential::new()),
        AuthMechanism::AzureCli => Arc::new(CachedCredential::new(Arc::new(AzureCliCredential::new()))),
        AuthMechanism::ManagedIdentity => Arc::new(CachedCredential::new(Arc::new(
            ManagedIdentityCredential::new(http),
        ))),
        AuthMechanism::DefaultAzure => Arc::new(CachedCredential::new(Arc::new(
            DefaultAzureCredential::new(http),
        ))),
    }
}

/// Provider for unauthenticated endpoints. Never yields a token.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousCredential;

#[async_trait]
impl CredentialProvider for AnonymousCredential {
    async fn get_token(&self, _scope: &str) -> Result<AccessToken, UpstreamError> {
        Err(UpstreamError::Credential(
            "authentication is disabled for this connection".to_string(),
        ))
    }

    fn mechanism(&self) -> AuthMechanism {
        AuthMechanism::None
    }
}

/// Fixed token, mainly for tests and for tokens passed on the command line.
#[derive(Debug, Clone)]
pub struct StaticTokenCredential {
    token: AccessToken,
    mechanism: AuthMechanism,
}

impl StaticTokenCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: AccessToken::new(token, None),
            mechanism: AuthMechanism::Environment,
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenCredential {
    async fn get_token(&self, _scope: &str) -> Result<AccessToken, UpstreamError> {
        Ok(self.token.clone())
    }

    fn mechanism(&self) -> AuthMechanism {
        self.mechanism
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads a pre-acquired token from the environment.
#[derive(Clone)]
pub struct EnvironmentCredential {
    lookup: EnvLookup,
}

impl EnvironmentCredential {
    pub fn new() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Arc::new(lookup),
        }
    }
}

impl Default for EnvironmentCredential {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EnvironmentCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentCredential").finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialProvider for EnvironmentCredential {
    async fn get_token(&self, _scope: &str) -> Result<AccessToken, UpstreamError> {
        [ENV_ACCESS_TOKEN, ENV_AZURE_ACCESS_TOKEN]
            .iter()
            .find_map(|key| (self.lookup)(*key).filter(|v| !v.trim().is_empty()))
            .map(|token| AccessToken::new(token.trim(), None))
            .ok_or_else(|| {
                UpstreamError::Credential(format!(
                    "neither {ENV_ACCESS_TOKEN} nor {ENV_AZURE_ACCESS_TOKEN} is set"
                ))
            })
    }

    fn mechanism(&self) -> AuthMechanism {
        AuthMechanism::Environment
    }
}

/// Acquires tokens by shelling out to `az account get-access-token`.
#[derive(Debug, Clone)]
pub struct AzureCliCredential {
    program: String,
    timeout: Duration,
}

impl AzureCliCredential {
    pub fn new() -> Self {
        Self {
            program: "az".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

impl Default for AzureCliCredential {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for AzureCliCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, UpstreamError> {
        debug!("Requesting token for {} from Azure CLI", scope);

        let command = tokio::process::Command::new(&self.program)
            .args(["account", "get-access-token", "--scope", scope, "--output", "json"])
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, command)
            .await
            .map_err(|_| UpstreamError::Credential("Azure CLI timed out".to_string()))?
            .map_err(|e| UpstreamError::Credential(format!("failed to run Azure CLI: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UpstreamError::Credential(format!(
                "Azure CLI exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_cli_token(&output.stdout)
    }

    fn mechanism(&self) -> AuthMechanism {
        AuthMechanism::AzureCli
    }
}

fn parse_cli_token(stdout: &[u8]) -> Result<AccessToken, UpstreamError> {
    let body: Value = serde_json::from_slice(stdout)
        .map_err(|e| UpstreamError::Credential(format!("unreadable Azure CLI output: {e}")))?;

    let token = body
        .get("accessToken")
        .and_then(Value::as_str)
        .ok_or_else(|| UpstreamError::Credential("Azure CLI output has no accessToken".to_string()))?;

    // Newer CLI versions add `expires_on` as epoch seconds; older ones only
    // report `expiresOn` in local time.
    let expires_on = body
        .get("expires_on")
        .and_then(epoch_seconds)
        .or_else(|| body.get("expiresOn").and_then(Value::as_str).and_then(local_timestamp));

    Ok(AccessToken::new(token, expires_on))
}

fn epoch_seconds(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    Utc.timestamp_opt(secs, 0).single()
}

/// `2024-05-01 10:00:00.000000` in the machine's time zone.
fn local_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Acquires tokens from the instance metadata service.
#[derive(Debug, Clone)]
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    endpoint: String,
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: IMDS_ENDPOINT.to_string(),
            client_id: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Select a user-assigned identity.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

#[async_trait]
impl CredentialProvider for ManagedIdentityCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, UpstreamError> {
        let resource = scope.strip_suffix("/.default").unwrap_or(scope);
        debug!("Requesting managed identity token for {}", resource);

        let mut query = vec![("api-version", IMDS_API_VERSION), ("resource", resource)];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id));
        }

        let response = self
            .http
            .get(&self.endpoint)
            .header("Metadata", "true")
            .query(&query)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| UpstreamError::Credential(format!("managed identity endpoint unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Credential(format!(
                "managed identity endpoint returned {status}: {text}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::Credential(format!("unreadable managed identity response: {e}")))?;

        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| UpstreamError::Credential("managed identity response has no access_token".to_string()))?;

        Ok(AccessToken::new(token, body.get("expires_on").and_then(epoch_seconds)))
    }

    fn mechanism(&self) -> AuthMechanism {
        AuthMechanism::ManagedIdentity
    }
}

/// Tries a chain of providers and returns the first token obtained.
#[derive(Debug, Clone)]
pub struct DefaultAzureCredential {
    chain: Vec<Arc<dyn CredentialProvider>>,
}

impl DefaultAzureCredential {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_chain(vec![
            Arc::new(EnvironmentCredential::new()),
            Arc::new(AzureCliCredential::new()),
            Arc::new(ManagedIdentityCredential::new(http)),
        ])
    }

    pub fn with_chain(chain: Vec<Arc<dyn CredentialProvider>>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl CredentialProvider for DefaultAzureCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, UpstreamError> {
        let mut failures = Vec::with_capacity(self.chain.len());

        for provider in &self.chain {
            match provider.get_token(scope).await {
                Ok(token) => {
                    debug!("Token for {} obtained via {}", scope, provider.mechanism());
                    return Ok(token);
                }
                Err(e) => failures.push(format!("{}: {}", provider.mechanism(), e)),
            }
        }

        Err(UpstreamError::Credential(format!(
            "no credential in the chain succeeded ({})",
            failures.join("; ")
        )))
    }

    fn mechanism(&self) -> AuthMechanism {
        AuthMechanism::DefaultAzure
    }
}

#[derive(Debug)]
struct CachedToken {
    token: AccessToken,
    reuse_until: DateTime<Utc>,
}

/// Caches tokens per scope until shortly before they expire.
///
/// Tokens whose provider reported no expiry are reused only for a short
/// fixed period.
#[derive(Debug)]
pub struct CachedCredential {
    inner: Arc<dyn CredentialProvider>,
    tokens: Mutex<HashMap<String, CachedToken>>,
    margin: chrono::Duration,
    unknown_expiry_ttl: chrono::Duration,
}

impl CachedCredential {
    pub fn new(inner: Arc<dyn CredentialProvider>) -> Self {
        Self {
            inner,
            tokens: Mutex::new(HashMap::new()),
            margin: chrono::Duration::seconds(REFRESH_MARGIN_SECS),
            unknown_expiry_ttl: chrono::Duration::seconds(UNKNOWN_EXPIRY_TTL_SECS),
        }
    }

    pub fn with_unknown_expiry_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.unknown_expiry_ttl = ttl;
        self
    }
}

#[async_trait]
impl CredentialProvider for CachedCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, UpstreamError> {
        if let Some(cached) = self.tokens.lock().get(scope) {
            if cached.reuse_until > Utc::now() {
                return Ok(cached.token.clone());
            }
        }

        let token = self.inner.get_token(scope).await?;
        let now = Utc::now();
        let reuse_until = match token.expires_on {
            Some(expiry) => expiry - self.margin,
            None => {
                debug!("Token for {} has no expiry, reusing it for {}s", scope, self.unknown_expiry_ttl.num_seconds());
                now + self.unknown_expiry_ttl
            }
        };
        if reuse_until > now {
            self.tokens.lock().insert(
                scope.to_string(),
                CachedToken {
                    token: token.clone(),
                    reuse_until,
                },
            );
        } else {
            self.tokens.lock().remove(scope);
        }
        Ok(token)
    }

    fn mechanism(&self) -> AuthMechanism {
        self.inner.mechanism()
    }
}
