//! OAuth 2.0 credential lifecycle for installed-app clients.
//!
//! [`TokenManager`] owns the cached credential for a connector and hands out
//! access tokens:
//!
//! 1. Load the credential cache (JSON) if present.
//! 2. If the access token is expired and a refresh token exists, refresh it
//!    and persist the result. No user interaction.
//! 3. Otherwise run the authorization-code flow (PKCE, `access_type=offline`,
//!    `prompt=consent`) through an [`AuthorizationPrompt`], exchange the code
//!    and persist.
//!
//! Forced re-authorization deletes the cache once, before the first token
//! is handed out.
//!
//! Two prompts are provided. [`LoopbackPrompt`] listens on `127.0.0.1` for the
//! browser redirect. [`ConsolePrompt`] prints the URL and reads either the
//! bare code or the whole redirected URL from a line of input, which is what
//! headless machines need. [`SystemPrompt::detect`] picks between them.

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::atomic;
use crate::error::AuthError;

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Tokens this close to expiry are refreshed early.
const EXPIRY_SKEW_SECS: i64 = 60;

const LOOPBACK_TIMEOUT: Duration = Duration::from_secs(300);

// ============ Client secrets ============

/// OAuth client registration, as downloaded from the provider console.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}
fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Deserialize)]
struct SecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let raw = std::fs::read_to_string(path).map_err(|e| AuthError::Secrets {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&raw).map_err(|reason| AuthError::Secrets {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Accepts the `{"installed": {...}}` / `{"web": {...}}` wrappers.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let file: SecretsFile = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        file.installed
            .or(file.web)
            .ok_or_else(|| "expected an \"installed\" or \"web\" client entry".to_string())
    }
}

// ============ Credential ============

/// A cached OAuth credential.
///
/// `token` is accepted as an alias for `access_token` so caches written by
/// Google's Python client load as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthCredential {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthCredential {
    /// A credential without an expiry is treated as valid until the API
    /// rejects it.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => expiry <= now + ChronoDuration::seconds(EXPIRY_SKEW_SECS),
            None => false,
        }
    }

    pub fn covers(&self, required: &[String]) -> bool {
        required.iter().all(|s| self.scopes.contains(s))
    }

    fn from_response(
        response: TokenResponse,
        previous_refresh: Option<String>,
        fallback_scopes: &[String],
        now: DateTime<Utc>,
    ) -> Self {
        let scopes = match response.scope {
            Some(scope) if !scope.trim().is_empty() => {
                scope.split_whitespace().map(String::from).collect()
            }
            _ => fallback_scopes.to_vec(),
        };
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(previous_refresh),
            expiry: response
                .expires_in
                .map(|secs| now + ChronoDuration::seconds(secs)),
            scopes,
            token_type: response.token_type.unwrap_or_else(default_token_type),
        }
    }
}

/// Token endpoint response body.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

// ============ Token endpoint ============

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange_code(
        &self,
        secrets: &ClientSecrets,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, AuthError>;

    async fn refresh(
        &self,
        secrets: &ClientSecrets,
        refresh_token: &str,
    ) -> Result<TokenResponse, AuthError>;
}

/// Talks to the real `token_uri` over HTTPS.
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
}

impl HttpTokenEndpoint {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn post(&self, url: &str, form: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let response = self.client.post(url).form(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn exchange_code(
        &self,
        secrets: &ClientSecrets,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, AuthError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", secrets.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
        ];
        if let Some(secret) = &secrets.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        self.post(&secrets.token_uri, &form).await
    }

    async fn refresh(
        &self,
        secrets: &ClientSecrets,
        refresh_token: &str,
    ) -> Result<TokenResponse, AuthError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", secrets.client_id.as_str()),
        ];
        if let Some(secret) = &secrets.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        self.post(&secrets.token_uri, &form).await
    }
}

// ============ Authorization request ============

/// PKCE verifier and its S256 challenge.
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

pub fn authorization_url(
    secrets: &ClientSecrets,
    scopes: &[String],
    redirect_uri: &str,
    state: &str,
    code_challenge: &str,
) -> Result<String, AuthError> {
    let scope = scopes.join(" ");
    let url = Url::parse_with_params(
        &secrets.auth_uri,
        &[
            ("response_type", "code"),
            ("client_id", secrets.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("scope", scope.as_str()),
            ("state", state),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("include_granted_scopes", "true"),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256"),
        ],
    )
    .map_err(|e| AuthError::Declined(format!("invalid auth_uri '{}': {}", secrets.auth_uri, e)))?;
    Ok(url.into())
}

/// Pull the authorization code out of a redirect URL's query string.
fn code_from_url(url: &Url, expected_state: &str) -> Result<String, String> {
    let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    code_from_params(&params, expected_state)
}

fn code_from_params(params: &HashMap<String, String>, expected_state: &str) -> Result<String, String> {
    if let Some(error) = params.get("error") {
        return Err(format!("authorization server returned '{}'", error));
    }
    if let Some(state) = params.get("state") {
        if state != expected_state {
            return Err("state parameter does not match this authorization request".into());
        }
    }
    params
        .get("code")
        .filter(|c| !c.is_empty())
        .cloned()
        .ok_or_else(|| "no 'code' parameter found".to_string())
}

/// Accept either a bare code or the full redirected URL.
pub fn parse_pasted_code(input: &str, expected_state: &str) -> Result<String, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty input".into());
    }
    if input.contains("://") {
        let url = Url::parse(input).map_err(|e| format!("not a valid URL: {}", e))?;
        return code_from_url(&url, expected_state);
    }
    if input.starts_with('?') || input.contains("code=") {
        let url = Url::parse(&format!("http://localhost/{}", input.trim_start_matches('/')))
            .map_err(|e| format!("not a valid query string: {}", e))?;
        return code_from_url(&url, expected_state);
    }
    if input.chars().any(char::is_whitespace) {
        return Err("codes do not contain whitespace".into());
    }
    Ok(input.to_string())
}

// ============ Prompts ============

/// Obtains an authorization code from the user.
#[async_trait]
pub trait AuthorizationPrompt: Send {
    /// Redirect URI to register in the authorization request.
    async fn redirect_uri(&mut self, secrets: &ClientSecrets) -> Result<String, AuthError>;

    async fn obtain_code(&mut self, authorization_url: &str, state: &str)
        -> Result<String, AuthError>;
}

/// Reads the code (or redirected URL) from a line-oriented input.
pub struct ConsolePrompt<R> {
    input: R,
}

impl<R> ConsolePrompt<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }
}

impl ConsolePrompt<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> AuthorizationPrompt for ConsolePrompt<R> {
    async fn redirect_uri(&mut self, secrets: &ClientSecrets) -> Result<String, AuthError> {
        Ok(secrets
            .redirect_uris
            .first()
            .cloned()
            .unwrap_or_else(|| "http://localhost".to_string()))
    }

    async fn obtain_code(
        &mut self,
        authorization_url: &str,
        state: &str,
    ) -> Result<String, AuthError> {
        eprintln!("Open this URL in a browser and authorize access:\n\n  {authorization_url}\n");
        eprintln!("Then paste the verification code, or the full URL you were redirected to.");
        loop {
            eprint!("code> ");
            let mut line = String::new();
            let read = self
                .input
                .read_line(&mut line)
                .await
                .map_err(|e| AuthError::Declined(format!("reading input: {}", e)))?;
            if read == 0 {
                return Err(AuthError::Declined("input closed before a code was entered".into()));
            }
            match parse_pasted_code(&line, state) {
                Ok(code) => return Ok(code),
                Err(reason) => eprintln!("Could not use that input ({reason}); try again."),
            }
        }
    }
}

/// Waits for the browser redirect on a loopback port.
pub struct LoopbackPrompt {
    listener: Option<TcpListener>,
    timeout: Duration,
}

impl LoopbackPrompt {
    pub fn new() -> Self {
        Self {
            listener: None,
            timeout: LOOPBACK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ============ Redirect receiver ============

#[derive(Clone)]
struct RedirectState {
    expected_state: Arc<str>,
    outcome: Arc<Mutex<Option<oneshot::Sender<Result<String, String>>>>>,
}

/// `GET /?code=..&state=..` from the browser. The first request carrying a
/// code or an error settles the flow; anything else gets a 404.
async fn handle_redirect(
    State(state): State<RedirectState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !params.contains_key("code") && !params.contains_key("error") {
        return (StatusCode::NOT_FOUND, "Waiting for the authorization redirect.").into_response();
    }

    let outcome = code_from_params(&params, &state.expected_state);
    let reply = match &outcome {
        Ok(_) => (StatusCode::OK, "Authorization complete. You can close this window."),
        Err(_) => (
            StatusCode::BAD_REQUEST,
            "Authorization failed. Return to the terminal.",
        ),
    };

    let sender = state.outcome.lock().ok().and_then(|mut slot| slot.take());
    match sender {
        Some(tx) => {
            let _ = tx.send(outcome);
        }
        None => tracing::debug!("authorization redirect arrived after the flow settled"),
    }
    reply.into_response()
}

/// Serve the redirect route on `listener` until one outcome arrives or
/// `timeout` expires, then shut the server down.
async fn receive_redirect(
    listener: TcpListener,
    expected_state: &str,
    timeout: Duration,
) -> Result<String, AuthError> {
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let app = Router::new()
        .route("/", get(handle_redirect))
        .with_state(RedirectState {
            expected_state: Arc::from(expected_state),
            outcome: Arc::new(Mutex::new(Some(outcome_tx))),
        });

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let received = tokio::time::timeout(timeout, outcome_rx).await;

    let _ = stop_tx.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "loopback server stopped with an error"),
        Err(e) => tracing::warn!(error = %e, "loopback server task failed"),
    }

    match received {
        Err(_) => Err(AuthError::Timeout),
        Ok(Err(_)) => Err(AuthError::Declined(
            "loopback server stopped before the redirect arrived".into(),
        )),
        Ok(Ok(Ok(code))) => Ok(code),
        Ok(Ok(Err(reason))) => Err(AuthError::Declined(reason)),
    }
}

impl Default for LoopbackPrompt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthorizationPrompt for LoopbackPrompt {
    async fn redirect_uri(&mut self, _secrets: &ClientSecrets) -> Result<String, AuthError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| AuthError::Declined(format!("cannot bind loopback listener: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| AuthError::Declined(e.to_string()))?
            .port();
        self.listener = Some(listener);
        Ok(format!("http://127.0.0.1:{}/", port))
    }

    async fn obtain_code(
        &mut self,
        authorization_url: &str,
        state: &str,
    ) -> Result<String, AuthError> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| AuthError::Declined("loopback listener was not started".into()))?;
        eprintln!("Open this URL in a browser to authorize access:\n\n  {authorization_url}\n");
        tracing::info!("waiting for the authorization redirect");
        receive_redirect(listener, state, self.timeout).await
    }
}

/// Loopback when a desktop session is available, console otherwise.
pub enum SystemPrompt {
    Loopback(LoopbackPrompt),
    Console(ConsolePrompt<BufReader<Stdin>>),
}

impl SystemPrompt {
    pub fn detect(headless: bool) -> Self {
        let has_display = ["DISPLAY", "WAYLAND_DISPLAY", "BROWSER"]
            .iter()
            .any(|var| std::env::var_os(var).is_some_and(|v| !v.is_empty()));
        if headless || !has_display {
            SystemPrompt::Console(ConsolePrompt::stdin())
        } else {
            SystemPrompt::Loopback(LoopbackPrompt::new())
        }
    }
}

#[async_trait]
impl AuthorizationPrompt for SystemPrompt {
    async fn redirect_uri(&mut self, secrets: &ClientSecrets) -> Result<String, AuthError> {
        if let SystemPrompt::Loopback(prompt) = self {
            match prompt.redirect_uri(secrets).await {
                Ok(uri) => return Ok(uri),
                Err(e) => {
                    tracing::warn!(error = %e, "loopback authorization unavailable, using console");
                    *self = SystemPrompt::Console(ConsolePrompt::stdin());
                }
            }
        }
        match self {
            SystemPrompt::Loopback(prompt) => prompt.redirect_uri(secrets).await,
            SystemPrompt::Console(prompt) => prompt.redirect_uri(secrets).await,
        }
    }

    async fn obtain_code(
        &mut self,
        authorization_url: &str,
        state: &str,
    ) -> Result<String, AuthError> {
        match self {
            SystemPrompt::Loopback(prompt) => prompt.obtain_code(authorization_url, state).await,
            SystemPrompt::Console(prompt) => prompt.obtain_code(authorization_url, state).await,
        }
    }
}

// ============ Token manager ============

/// Owns one connector's credential and keeps it usable.
pub struct TokenManager {
    secrets: ClientSecrets,
    cache_path: PathBuf,
    scopes: Vec<String>,
    endpoint: Box<dyn TokenEndpoint>,
    prompt: Box<dyn AuthorizationPrompt>,
    force_reauth: bool,
    credential: Option<OAuthCredential>,
}

impl TokenManager {
    pub fn new(
        secrets: ClientSecrets,
        cache_path: PathBuf,
        scopes: Vec<String>,
        endpoint: Box<dyn TokenEndpoint>,
        prompt: Box<dyn AuthorizationPrompt>,
    ) -> Self {
        Self {
            secrets,
            cache_path,
            scopes,
            endpoint,
            prompt,
            force_reauth: false,
            credential: None,
        }
    }

    /// Discard the cached credential before the first token is issued.
    pub fn force_reauth(mut self, force: bool) -> Self {
        self.force_reauth = force;
        self
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// A currently valid access token, refreshing or bootstrapping as needed.
    pub async fn access_token(&mut self) -> Result<String, AuthError> {
        if self.force_reauth {
            self.discard_cache()?;
            self.force_reauth = false;
        }

        let cached = match self.credential.take() {
            Some(credential) => Some(credential),
            None => self.load_cache(),
        };

        let now = Utc::now();
        let credential = match cached {
            Some(credential) if !credential.covers(&self.scopes) => {
                tracing::info!("cached credential does not cover the configured scopes");
                self.bootstrap().await?
            }
            Some(credential) if !credential.is_expired(now) => credential,
            Some(credential) => match credential.refresh_token.clone() {
                Some(refresh_token) => self.refresh(credential, &refresh_token).await?,
                None => {
                    tracing::info!("access token expired and no refresh token is cached");
                    self.bootstrap().await?
                }
            },
            None => self.bootstrap().await?,
        };

        let token = credential.access_token.clone();
        self.credential = Some(credential);
        Ok(token)
    }

    /// Forget the in-memory token's validity so the next call refreshes.
    pub fn invalidate(&mut self) {
        if let Some(credential) = self.credential.as_mut() {
            credential.expiry = Some(Utc::now() - ChronoDuration::seconds(1));
        }
    }

    async fn refresh(
        &mut self,
        previous: OAuthCredential,
        refresh_token: &str,
    ) -> Result<OAuthCredential, AuthError> {
        tracing::debug!("refreshing access token");
        let response = self.endpoint.refresh(&self.secrets, refresh_token).await?;
        let credential = OAuthCredential::from_response(
            response,
            previous.refresh_token,
            &previous.scopes,
            Utc::now(),
        );
        self.save_cache(&credential)?;
        Ok(credential)
    }

    async fn bootstrap(&mut self) -> Result<OAuthCredential, AuthError> {
        let pkce = Pkce::generate();
        let state = uuid::Uuid::new_v4().simple().to_string();
        let redirect_uri = self.prompt.redirect_uri(&self.secrets).await?;
        let url = authorization_url(
            &self.secrets,
            &self.scopes,
            &redirect_uri,
            &state,
            &pkce.challenge,
        )?;

        let code = self.prompt.obtain_code(&url, &state).await?;
        let response = self
            .endpoint
            .exchange_code(&self.secrets, &code, &redirect_uri, &pkce.verifier)
            .await?;
        let credential = OAuthCredential::from_response(response, None, &self.scopes, Utc::now());
        self.save_cache(&credential)?;
        tracing::info!(path = %self.cache_path.display(), "stored new credential");
        Ok(credential)
    }

    fn load_cache(&self) -> Option<OAuthCredential> {
        let raw = std::fs::read(&self.cache_path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(credential) => Some(credential),
            Err(e) => {
                tracing::warn!(
                    path = %self.cache_path.display(),
                    error = %e,
                    "ignoring unreadable credential cache"
                );
                None
            }
        }
    }

    fn save_cache(&self, credential: &OAuthCredential) -> Result<(), AuthError> {
        let cache_err = |source| AuthError::Cache {
            path: self.cache_path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(credential)
            .map_err(|e| cache_err(std::io::Error::other(e)))?;
        let staged = atomic::stage(&self.cache_path, &bytes).map_err(cache_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            staged
                .as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(cache_err)?;
        }
        atomic::commit(staged, &self.cache_path).map_err(cache_err)
    }

    fn discard_cache(&mut self) -> Result<(), AuthError> {
        self.credential = None;
        match std::fs::remove_file(&self.cache_path) {
            Ok(()) => {
                tracing::info!(path = %self.cache_path.display(), "discarded cached credential");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(AuthError::Cache {
                path: self.cache_path.clone(),
                source,
            }),
        }
    }
}
