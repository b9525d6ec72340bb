//! OAuth2 authorization and token refresh for Google Drive.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::provider::TokenRefresher;
use worldback_common::{Credential, Error, Result, SecretString};

/// OAuth2 authorization endpoint.
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// OAuth2 token endpoint.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Loopback redirect for the installed-app flow.
const REDIRECT_URL: &str = "http://localhost:8888/callback";

/// Only files created by this application are visible to it.
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

type GoogleClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// OAuth2 client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Client ID issued by the Google Cloud console.
    pub client_id: String,
    /// Client secret.
    pub client_secret: SecretString,
    /// Authorization endpoint.
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    /// Token endpoint.
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    /// Redirect URL for the OAuth2 callback.
    #[serde(default = "default_redirect_url")]
    pub redirect_url: String,
}

fn default_auth_uri() -> String {
    GOOGLE_AUTH_URL.to_string()
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

fn default_redirect_url() -> String {
    REDIRECT_URL.to_string()
}

/// Layout of a `credentials.json` downloaded from the Google Cloud console.
#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    #[serde(default)]
    installed: Option<ClientSecretsEntry>,
    #[serde(default)]
    web: Option<ClientSecretsEntry>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsEntry {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    auth_uri: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
}

impl OAuthConfig {
    /// Build a configuration from explicit client credentials.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::new(client_secret),
            auth_uri: default_auth_uri(),
            token_uri: default_token_uri(),
            redirect_url: default_redirect_url(),
        }
    }

    /// Parse a Google client secrets document (`installed` or `web`).
    ///
    /// # Errors
    /// - `Serialization` if the JSON is malformed
    /// - `InvalidInput` if neither section is present
    pub fn from_client_secrets(json: &str) -> Result<Self> {
        let file: ClientSecretsFile =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;

        let entry = file.installed.or(file.web).ok_or_else(|| {
            Error::InvalidInput(
                "Client secrets must contain an 'installed' or 'web' section".to_string(),
            )
        })?;

        let mut config = Self::new(entry.client_id, entry.client_secret);
        if let Some(auth_uri) = entry.auth_uri {
            config.auth_uri = auth_uri;
        }
        if let Some(token_uri) = entry.token_uri {
            config.token_uri = token_uri;
        }
        Ok(config)
    }

    /// Load a client secrets file from disk.
    ///
    /// # Errors
    /// - `AuthenticationRequired` if the file does not exist
    pub fn from_client_secrets_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::AuthenticationRequired(format!(
                    "Client secrets not found at {}",
                    path.display()
                ))
            } else {
                Error::Io(e)
            }
        })?;
        Self::from_client_secrets(&json)
    }
}

/// OAuth2 client for the Google Drive API.
pub struct GoogleAuth {
    client: GoogleClient,
    http: oauth2::reqwest::Client,
    config: OAuthConfig,
}

impl GoogleAuth {
    /// Create a new OAuth2 client.
    ///
    /// # Errors
    /// - `InvalidInput` if any endpoint URL is malformed
    /// - `Network` if the HTTP client cannot be built
    pub fn new(config: OAuthConfig) -> Result<Self> {
        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.expose().to_string()))
            .set_auth_uri(
                AuthUrl::new(config.auth_uri.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(config.token_uri.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
            );

        // Following redirects from the token endpoint would leak the client secret.
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            http,
            config,
        })
    }

    /// Generate the authorization URL for the user to visit.
    ///
    /// Returns the URL and the CSRF state to verify on callback.
    pub fn authorization_url(&self) -> (String, String) {
        let (auth_url, csrf_token) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(DRIVE_SCOPE.to_string()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();

        (auth_url.to_string(), csrf_token.secret().clone())
    }

    /// Exchange an authorization code for a credential.
    ///
    /// # Errors
    /// - `AuthenticationRequired` if the code is rejected or no refresh
    ///   token is returned
    /// - `Network` on transport failures
    pub async fn exchange_code(&self, code: &str) -> Result<Credential> {
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(resp) => Error::AuthenticationRequired(
                    format!("Authorization code rejected: {}", resp.error()),
                ),
                other => Error::Network(format!("Token exchange failed: {}", other)),
            })?;

        if response.refresh_token().is_none() {
            return Err(Error::AuthenticationRequired(
                "No refresh token received; offline access must be granted".to_string(),
            ));
        }

        credential_from_response(&response, None)
    }

    /// Get the current configuration.
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }
}

#[async_trait]
impl TokenRefresher for GoogleAuth {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
        tracing::debug!("Refreshing Google access token");

        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(resp) => {
                    Error::RefreshDenied(format!("Refresh token rejected: {}", resp.error()))
                }
                other => Error::Network(format!("Token refresh failed: {}", other)),
            })?;

        credential_from_response(&response, Some(refresh_token))
    }
}

/// Build a credential from a token response.
///
/// Google omits the refresh token on refresh responses, in which case the
/// previous one stays valid.
fn credential_from_response(
    response: &BasicTokenResponse,
    previous_refresh: Option<&str>,
) -> Result<Credential> {
    let refresh_token = response
        .refresh_token()
        .map(|t| t.secret().clone())
        .or_else(|| previous_refresh.map(str::to_string))
        .ok_or_else(|| Error::AuthenticationRequired("No refresh token available".to_string()))?;

    let lifetime = response
        .expires_in()
        .and_then(|d| Duration::from_std(d).ok())
        .unwrap_or_else(|| Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));

    Ok(Credential::new(
        response.access_token().secret().clone(),
        refresh_token,
        Utc::now() + lifetime,
    ))
}

/// One-shot HTTP listener that captures the OAuth2 redirect.
pub struct LoopbackReceiver {
    listener: TcpListener,
}

impl LoopbackReceiver {
    /// Bind to the loopback port named in `redirect_url`.
    pub async fn bind(redirect_url: &str) -> Result<Self> {
        let url = url::Url::parse(redirect_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidInput("Redirect URL has no port".to_string()))?;
        Self::bind_port(port).await
    }

    /// Bind to `127.0.0.1:port`; port 0 picks a free one.
    pub async fn bind_port(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        Ok(Self { listener })
    }

    /// Port the receiver is listening on.
    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Wait for the browser redirect and return the authorization code.
    ///
    /// Requests without a `code` or `error` parameter (favicon probes) are
    /// answered and ignored.
    ///
    /// # Errors
    /// - `AuthenticationRequired` if the user denied access or the state
    ///   does not match
    pub async fn wait_for_code(self, expected_state: &str) -> Result<String> {
        loop {
            let (mut stream, _) = self.listener.accept().await?;
            let (reader, mut writer) = stream.split();

            let mut request_line = String::new();
            BufReader::new(reader).read_line(&mut request_line).await?;

            let outcome = parse_callback(&request_line, expected_state);
            let body = match &outcome {
                Some(Ok(_)) => "Authorization complete. You can close this window.",
                Some(Err(_)) => "Authorization failed. Check the terminal for details.",
                None => "",
            };
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            writer.write_all(response.as_bytes()).await?;
            writer.shutdown().await?;

            if let Some(result) = outcome {
                return result;
            }
        }
    }
}

/// Extract the authorization code from an HTTP request line.
fn parse_callback(request_line: &str, expected_state: &str) -> Option<Result<String>> {
    let target = request_line.split_whitespace().nth(1)?;
    let url = url::Url::parse(&format!("http://localhost{}", target)).ok()?;

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Some(Err(Error::AuthenticationRequired(format!(
            "Authorization denied: {}",
            error
        ))));
    }

    let code = code?;
    if state.as_deref() != Some(expected_state) {
        return Some(Err(Error::AuthenticationRequired(
            "OAuth state mismatch".to_string(),
        )));
    }
    Some(Ok(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[test]
    fn test_client_secrets_installed() {
        let json = r#"{
            "installed": {
                "client_id": "id.apps.googleusercontent.com",
                "client_secret": "shh",
                "auth_uri": "https://accounts.google.com/o/oauth2/auth",
                "token_uri": "https://oauth2.googleapis.com/token",
                "redirect_uris": ["http://localhost"]
            }
        }"#;

        let config = OAuthConfig::from_client_secrets(json).unwrap();
        assert_eq!(config.client_id, "id.apps.googleusercontent.com");
        assert_eq!(config.client_secret.expose(), "shh");
        assert_eq!(config.auth_uri, "https://accounts.google.com/o/oauth2/auth");
        assert_eq!(config.redirect_url, REDIRECT_URL);
    }

    #[test]
    fn test_client_secrets_web() {
        let json = r#"{"web": {"client_id": "web-id", "client_secret": "s"}}"#;
        let config = OAuthConfig::from_client_secrets(json).unwrap();
        assert_eq!(config.client_id, "web-id");
        assert_eq!(config.token_uri, GOOGLE_TOKEN_URL);
    }

    #[test]
    fn test_client_secrets_missing_section() {
        let result = OAuthConfig::from_client_secrets(r#"{"other": {}}"#);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_client_secrets_file_missing() {
        let temp = tempfile::TempDir::new().unwrap();
        let result = OAuthConfig::from_client_secrets_file(temp.path().join("credentials.json"));
        assert!(matches!(result, Err(Error::AuthenticationRequired(_))));
    }

    #[test]
    fn test_authorization_url_generation() {
        let auth = GoogleAuth::new(OAuthConfig::new("test_id", "test_secret")).unwrap();
        let (url, state) = auth.authorization_url();

        assert!(url.contains("accounts.google.com"));
        assert!(url.contains("client_id=test_id"));
        assert!(url.contains("drive.file"));
        assert!(url.contains("access_type=offline"));
        assert!(!state.is_empty());
        assert_eq!(auth.config().client_id, "test_id");
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let mut config = OAuthConfig::new("id", "secret");
        config.token_uri = "not a url".to_string();
        assert!(matches!(GoogleAuth::new(config), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_parse_callback() {
        let line = "GET /callback?code=4%2Fabc&state=xyz HTTP/1.1\r\n";
        assert_eq!(parse_callback(line, "xyz").unwrap().unwrap(), "4/abc");

        let mismatch = parse_callback(line, "other").unwrap();
        assert!(matches!(mismatch, Err(Error::AuthenticationRequired(_))));

        let denied = parse_callback("GET /callback?error=access_denied HTTP/1.1", "xyz").unwrap();
        assert!(matches!(denied, Err(Error::AuthenticationRequired(_))));

        assert!(parse_callback("GET /favicon.ico HTTP/1.1", "xyz").is_none());
    }

    #[tokio::test]
    async fn test_loopback_receiver_captures_code() {
        let receiver = LoopbackReceiver::bind_port(0).await.unwrap();
        let port = receiver.port().unwrap();

        let browser = tokio::spawn(async move {
            for target in ["/favicon.ico", "/callback?code=the-code&state=s1"] {
                let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", target);
                stream.write_all(request.as_bytes()).await.unwrap();
                let mut response = Vec::new();
                tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut response)
                    .await
                    .unwrap();
                assert!(response.starts_with(b"HTTP/1.1 200 OK"));
            }
        });

        let code = receiver.wait_for_code("s1").await.unwrap();
        assert_eq!(code, "the-code");
        browser.await.unwrap();
    }
}
