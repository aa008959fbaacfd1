//! Authenticating HTTP transport.
//!
//! Every request goes out with a browser-like user agent since the server's
//! guest access is gated on it. When the server answers with an auth
//! challenge, the transport logs in with the configured credentials and
//! replays the request once. Session cookies from the login are kept in the
//! client's cookie store.

use crate::error::{Result, SyncError};
use reqwest::header::{HeaderValue, USER_AGENT};
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode, Url};
use std::fmt;
use std::time::Duration;

/// Identification sent with every request
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64)";

/// Header the server uses in place of a 401
pub const AUTH_MSG_HEADER: &str = "x-com-ibm-team-repository-web-auth-msg";

const AUTH_REQUIRED: &str = "authrequired";
const AUTH_FAILED: &str = "authfailed";

/// Form login endpoint, relative to the base URL
pub const LOGIN_PATH: &str = "j_security_check";

#[derive(Clone)]
pub struct Credentials {
    pub user_id: String,
    password: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AuthenticatingTransport {
    client: Client,
    base_url: Url,
    credentials: Option<Credentials>,
}

impl AuthenticatingTransport {
    pub fn new(
        base_url: &str,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: parse_base_url(base_url)?,
            credentials,
        })
    }

    /// Base URL, always ending in `/`
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Send `request`, logging in and replaying it once if challenged.
    ///
    /// Returns `Ok(None)` when a login happened but the request body could
    /// not be replayed; the caller must rebuild the request and send it again.
    pub async fn execute(&self, mut request: Request) -> Result<Option<Response>> {
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        let replay = request.try_clone();
        let url = request.url().to_string();

        tracing::debug!("{} {}", request.method(), url);
        let response = self.client.execute(request).await?;
        if !needs_authentication(&response) {
            return Ok(Some(response));
        }

        let Some(credentials) = &self.credentials else {
            return Err(SyncError::AuthenticationRequired { url });
        };
        self.login(credentials).await?;

        let Some(replay) = replay else {
            tracing::debug!("Request body to {} is not replayable after login", url);
            return Ok(None);
        };

        let response = self.client.execute(replay).await?;
        if needs_authentication(&response) {
            return Err(SyncError::Authentication(format!(
                "server still requires authentication for {}",
                url
            )));
        }
        Ok(Some(response))
    }

    async fn login(&self, credentials: &Credentials) -> Result<()> {
        let url = self
            .base_url
            .join(LOGIN_PATH)
            .map_err(|e| SyncError::Config(format!("invalid login url: {}", e)))?;
        tracing::info!("Logging in as {}", credentials.user_id);

        let response = self
            .client
            .post(url)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .form(&[
                ("j_username", credentials.user_id.as_str()),
                ("j_password", credentials.password.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let rejected = status.is_client_error()
            || status.is_server_error()
            || auth_message(&response).is_some_and(|msg| {
                msg.eq_ignore_ascii_case(AUTH_FAILED) || msg.eq_ignore_ascii_case(AUTH_REQUIRED)
            });
        if rejected {
            return Err(SyncError::Authentication(format!(
                "login rejected for user {} (status {})",
                credentials.user_id, status
            )));
        }
        Ok(())
    }
}

fn auth_message(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(AUTH_MSG_HEADER)
        .and_then(|value| value.to_str().ok())
}

fn needs_authentication(response: &Response) -> bool {
    response.status() == StatusCode::UNAUTHORIZED
        || auth_message(response).is_some_and(|msg| msg.eq_ignore_ascii_case(AUTH_REQUIRED))
}

fn parse_base_url(base_url: &str) -> Result<Url> {
    let mut raw = base_url.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    let url = Url::parse(&raw)
        .map_err(|e| SyncError::Config(format!("invalid server url {}: {}", base_url, e)))?;
    if url.cannot_be_a_base() {
        return Err(SyncError::Config(format!(
            "server url {} cannot be used as a base",
            base_url
        )));
    }
    Ok(url)
}
