//! Login handshake against the MyTPU portal.
//!
//! The portal has no documented auth API: the OAuth client credential is
//! embedded in its minified JavaScript bundle, so a login first scrapes the
//! login page for the bundle name, then the bundle for the credential, and
//! only then submits the password grant. All of that lives behind
//! [`LoginFlow`] so a portal redesign touches exactly one type.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header;

use crate::error::{ClientError, Result};

/// Sessions are treated as expired this long before the portal would
/// actually reject them.
const EXPIRY_BUFFER: Duration = Duration::from_secs(60);

const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

static MAIN_JS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<script[^>]*src="(main\.[a-f0-9]+\.js)"[^>]*></script>"#).unwrap()
});

static BASIC_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"["']Authorization["']:\s*["']Basic ([A-Za-z0-9+/=]+)["']"#).unwrap()
});

// Some bundle builds inline the header without quoting the key.
static BASIC_TOKEN_FALLBACK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"Authorization:"Basic ([A-Za-z0-9+/=]+)""#).unwrap());

/// Account credentials, supplied once at client construction.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authenticated state for one account.
///
/// Owned exclusively by the client behind its state lock; never persisted,
/// so a fresh client always starts unauthenticated.
#[derive(Clone)]
pub struct Session {
    pub(crate) access_token: String,
    pub(crate) refresh_token: String,
    pub(crate) customer_id: String,
    pub(crate) expires_at: Instant,
}

impl Session {
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.saturating_duration_since(Instant::now()) <= EXPIRY_BUFFER
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("customer_id", &self.customer_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    user: Option<TokenUser>,
}

#[derive(serde::Deserialize)]
struct TokenUser {
    #[serde(rename = "customerId")]
    customer_id: Option<String>,
}

/// The portal's login handshake, narrowed to the two operations the client
/// needs. Production uses [`PortalLoginFlow`]; tests substitute their own.
#[async_trait::async_trait]
pub trait LoginFlow: Send + Sync {
    /// Full credential login.
    async fn login(&self, http: &reqwest::Client, credentials: &Credentials) -> Result<Session>;

    /// Exchange the session's refresh token for a fresh session.
    async fn refresh(&self, http: &reqwest::Client, current: &Session) -> Result<Session>;
}

/// Login flow for `myaccount.mytpu.org`.
pub struct PortalLoginFlow {
    base_url: String,
    // The client credential scraped from the JS bundle. Stable for the life
    // of a portal deployment, so it is cached after the first handshake.
    basic_token: Mutex<Option<String>>,
}

impl PortalLoginFlow {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            basic_token: Mutex::new(None),
        }
    }

    async fn basic_token(&self, http: &reqwest::Client) -> Result<String> {
        if let Some(token) = self.basic_token.lock().unwrap().clone() {
            return Ok(token);
        }

        let html = self.fetch_page(http, "/eportal/").await?;
        let bundle = extract_main_js(&html)?;
        tracing::debug!(bundle = %bundle, "scraping oauth client credential from portal bundle");

        let js = self.fetch_page(http, &format!("/eportal/{bundle}")).await?;
        let token = extract_basic_token(&js, &bundle)?;

        *self.basic_token.lock().unwrap() = Some(token.clone());
        Ok(token)
    }

    async fn fetch_page(&self, http: &reqwest::Client, path: &str) -> Result<String> {
        let resp = http.get(format!("{}{}", self.base_url, path)).send().await?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(ClientError::Unavailable(format!(
                "GET {path} returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(ClientError::Protocol(format!(
                "GET {path} returned {status}"
            )));
        }
        resp.text().await.map_err(ClientError::from)
    }

    async fn token_request(
        &self,
        http: &reqwest::Client,
        form: &[(&str, &str)],
        previous: Option<&Session>,
        op: &str,
    ) -> Result<Session> {
        let basic = self.basic_token(http).await?;

        let resp = http
            .post(format!("{}/rest/oauth/token", self.base_url))
            .header(header::AUTHORIZATION, format!("Basic {basic}"))
            .form(form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // 5xx is a portal outage the host can retry later; anything else
            // from the token endpoint means the grant was rejected. The
            // portal reports both as opaque bodies, so only the status code
            // is trusted here.
            if status.is_server_error() {
                return Err(ClientError::Unavailable(format!(
                    "{op} failed with status {status}: {body}"
                )));
            }
            tracing::debug!(%status, op, "portal rejected token grant");
            return Err(ClientError::Auth(format!("{op} rejected with status {status}")));
        }

        let body: TokenResponse = resp.json().await.map_err(|e| {
            ClientError::Protocol(format!("token endpoint returned invalid JSON: {e}"))
        })?;
        session_from_response(body, previous)
    }
}

#[async_trait::async_trait]
impl LoginFlow for PortalLoginFlow {
    async fn login(&self, http: &reqwest::Client, credentials: &Credentials) -> Result<Session> {
        tracing::debug!("starting credential login");
        let form = [
            ("grant_type", "password"),
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
        ];
        let session = self.token_request(http, &form, None, "login").await?;
        tracing::info!(
            has_refresh_token = session.has_refresh_token(),
            "portal login succeeded"
        );
        Ok(session)
    }

    async fn refresh(&self, http: &reqwest::Client, current: &Session) -> Result<Session> {
        if !current.has_refresh_token() {
            return Err(ClientError::Auth("no refresh token available".into()));
        }
        tracing::debug!("refreshing portal session");
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", current.refresh_token.as_str()),
        ];
        self.token_request(http, &form, Some(current), "token refresh")
            .await
    }
}

fn extract_main_js(html: &str) -> Result<String> {
    MAIN_JS_RE
        .captures(html)
        .map(|c| c[1].to_string())
        .ok_or_else(|| {
            ClientError::Protocol("login page no longer references a main.js bundle".into())
        })
}

fn extract_basic_token(js: &str, bundle: &str) -> Result<String> {
    BASIC_TOKEN_RE
        .captures(js)
        .or_else(|| BASIC_TOKEN_FALLBACK_RE.captures(js))
        .map(|c| c[1].to_string())
        .ok_or_else(|| ClientError::Protocol(format!("no basic auth token found in {bundle}")))
}

fn session_from_response(body: TokenResponse, previous: Option<&Session>) -> Result<Session> {
    let access_token = body
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ClientError::Auth("no access token in token response".into()))?;

    // The portal omits the refresh token and customer id on refresh grants;
    // carry them over from the session being replaced.
    let refresh_token = body
        .refresh_token
        .filter(|t| !t.is_empty())
        .or_else(|| previous.map(|s| s.refresh_token.clone()))
        .unwrap_or_default();
    if refresh_token.is_empty() {
        tracing::warn!("portal issued no refresh token; expiry will force a full login");
    }

    let customer_id = body
        .user
        .and_then(|u| u.customer_id)
        .filter(|c| !c.is_empty())
        .or_else(|| previous.map(|s| s.customer_id.clone()))
        .unwrap_or_default();

    let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);

    Ok(Session {
        access_token,
        refresh_token,
        customer_id,
        expires_at: Instant::now() + Duration::from_secs(expires_in),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(expires_in: Duration) -> Session {
        Session {
            access_token: "token".into(),
            refresh_token: "refresh".into(),
            customer_id: "CUST-1".into(),
            expires_at: Instant::now() + expires_in,
        }
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials::new("user@example.com", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("user@example.com"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn session_expires_one_minute_early() {
        assert!(session(Duration::from_secs(30)).is_expired());
        assert!(!session(Duration::from_secs(300)).is_expired());
    }

    #[test]
    fn extracts_bundle_name_from_login_page() {
        let html = r#"<html><head>
            <script type="text/javascript" src="main.16e8dec7eb52aa3d12ed.js" defer></script>
        </head></html>"#;
        assert_eq!(
            extract_main_js(html).unwrap(),
            "main.16e8dec7eb52aa3d12ed.js"
        );
    }

    #[test]
    fn missing_bundle_is_a_protocol_error() {
        let err = extract_main_js("<html><body>maintenance</body></html>").unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn extracts_basic_token_with_primary_pattern() {
        let js = r#"e.headers={"Authorization": "Basic YWJjOmRlZg=="}"#;
        assert_eq!(extract_basic_token(js, "main.js").unwrap(), "YWJjOmRlZg==");
    }

    #[test]
    fn extracts_basic_token_with_fallback_pattern() {
        let js = r#"headers:{Authorization:"Basic enp6OnF3ZQ=="}"#;
        assert_eq!(extract_basic_token(js, "main.js").unwrap(), "enp6OnF3ZQ==");
    }

    #[test]
    fn missing_basic_token_is_a_protocol_error() {
        let err = extract_basic_token("var x = 1;", "main.abc.js").unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn token_response_without_access_token_is_auth_error() {
        let body = TokenResponse {
            access_token: None,
            refresh_token: None,
            expires_in: None,
            user: None,
        };
        assert!(matches!(
            session_from_response(body, None),
            Err(ClientError::Auth(_))
        ));
    }

    #[test]
    fn refresh_response_carries_over_previous_identity() {
        let prev = session(Duration::from_secs(10));
        let body = TokenResponse {
            access_token: Some("new-token".into()),
            refresh_token: None,
            expires_in: Some(1800),
            user: None,
        };
        let renewed = session_from_response(body, Some(&prev)).unwrap();
        assert_eq!(renewed.access_token(), "new-token");
        assert_eq!(renewed.customer_id(), "CUST-1");
        assert!(renewed.has_refresh_token());
        assert!(!renewed.is_expired());
    }
}
