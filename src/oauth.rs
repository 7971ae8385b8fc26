use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;
use crate::network::{ApiRequest, Download, HttpClient, HttpResponse};

const REFRESH_ATTEMPTS: u32 = 5;
/// Tokens are refreshed this many seconds before they actually expire.
const EXPIRY_SLACK_SECS: i64 = 60;

/// Client credentials of an OAuth application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
}

impl OAuthConfig {
    /// Parses a downloaded client JSON, either wrapped in `web`/`installed`
    /// or flat.
    pub fn from_client_json(raw: &[u8]) -> anyhow::Result<Self> {
        let value: Value = serde_json::from_slice(raw).context("client JSON is not valid JSON")?;
        let inner = value
            .get("web")
            .or_else(|| value.get("installed"))
            .unwrap_or(&value)
            .clone();
        let config: OAuthConfig =
            serde_json::from_value(inner).context("client JSON lacks OAuth client fields")?;
        anyhow::ensure!(!config.client_id.is_empty(), "client_id must not be empty");
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl OAuthToken {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at > 0 && self.expires_at - EXPIRY_SLACK_SECS <= now
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    token_type: Option<String>,
    scope: Option<String>,
    error: Option<String>,
}

/// Receives every token the session obtains so it can be persisted.
pub type TokenUpdater = Arc<dyn Fn(&OAuthToken) + Send + Sync>;

pub struct OAuthSession {
    config: OAuthConfig,
    token: Option<OAuthToken>,
    scopes: Vec<String>,
    redirect_uri: String,
    updater: TokenUpdater,
}

impl fmt::Debug for OAuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthSession")
            .field("client_id", &self.config.client_id)
            .field("has_token", &self.token.is_some())
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl OAuthSession {
    pub fn new(
        config: OAuthConfig,
        token: Option<OAuthToken>,
        scopes: Vec<String>,
        redirect_uri: impl Into<String>,
        updater: TokenUpdater,
    ) -> Self {
        Self {
            config,
            token,
            scopes,
            redirect_uri: redirect_uri.into(),
            updater,
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// URL the user visits to grant access; `state` comes back on the callback.
    pub fn authorization_url(&self, state: &str) -> anyhow::Result<String> {
        let mut url = Url::parse(&self.config.auth_uri)
            .with_context(|| format!("invalid auth_uri {}", self.config.auth_uri))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);
        Ok(url.into())
    }

    /// Exchanges the authorization code carried by `callback_url`.
    pub async fn finish(&mut self, http: &HttpClient, callback_url: &str) -> Result<(), Error> {
        let code = authorization_code(callback_url)?;
        let req = ApiRequest::post_form(
            self.config.token_uri.clone(),
            vec![
                ("code".to_string(), code),
                ("client_id".to_string(), self.config.client_id.clone()),
                ("client_secret".to_string(), self.config.client_secret.clone()),
                ("redirect_uri".to_string(), self.redirect_uri.clone()),
                ("grant_type".to_string(), "authorization_code".to_string()),
            ],
        );
        let response = http.send(&req).await?;
        let token = self.accept_token_response(&response, None)?;
        info!(client_id = %self.config.client_id, "oauth link completed");
        self.store(token);
        Ok(())
    }

    fn accept_token_response(
        &self,
        response: &HttpResponse,
        previous_refresh: Option<String>,
    ) -> Result<OAuthToken, Error> {
        let parsed: TokenResponse = response.json()?;
        if let Some(error) = parsed.error {
            warn!(status = response.status, error, "token endpoint rejected request");
            return Err(Error::OAuthInvalid);
        }
        if !response.is_success() {
            return Err(Error::Http {
                status: response.status,
                message: response.text(),
            });
        }
        let access_token = parsed
            .access_token
            .ok_or_else(|| Error::Unknown("token response lacks access_token".to_string()))?;
        let now = Utc::now().timestamp();
        Ok(OAuthToken {
            access_token,
            refresh_token: parsed.refresh_token.or(previous_refresh),
            expires_at: parsed.expires_in.map(|secs| now + secs).unwrap_or(0),
            token_type: parsed.token_type,
            scope: parsed.scope,
        })
    }

    fn store(&mut self, token: OAuthToken) {
        (self.updater)(&token);
        self.token = Some(token);
    }

    async fn refresh(&mut self, http: &HttpClient) -> Result<(), Error> {
        let refresh_token = self
            .token
            .as_ref()
            .and_then(|t| t.refresh_token.clone())
            .ok_or(Error::OAuthInvalid)?;
        let req = ApiRequest::post_form(
            self.config.token_uri.clone(),
            vec![
                ("refresh_token".to_string(), refresh_token.clone()),
                ("client_id".to_string(), self.config.client_id.clone()),
                ("client_secret".to_string(), self.config.client_secret.clone()),
                ("grant_type".to_string(), "refresh_token".to_string()),
            ],
        );

        let mut last_error = Error::OAuthExpired;
        for attempt in 1..=REFRESH_ATTEMPTS {
            match http.send(&req).await {
                Ok(response) => match self.accept_token_response(&response, Some(refresh_token.clone())) {
                    Ok(token) => {
                        debug!(attempt, "oauth token refreshed");
                        self.store(token);
                        return Ok(());
                    }
                    Err(Error::OAuthInvalid) => return Err(Error::OAuthInvalid),
                    Err(err) => last_error = err,
                },
                Err(err) => last_error = err,
            }
            warn!(attempt, error = %last_error, "token refresh failed");
            sleep(Duration::from_millis(100) * attempt).await;
        }
        Err(last_error)
    }

    async fn access_token(&mut self, http: &HttpClient) -> Result<String, Error> {
        let now = Utc::now().timestamp();
        let expired = match &self.token {
            Some(token) => token.is_expired_at(now),
            None => return Err(Error::OAuthInvalid),
        };
        if expired {
            self.refresh(http).await?;
        }
        self.token
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or(Error::OAuthInvalid)
    }

    /// Sends `req` with the bearer token, refreshing it once on a 401.
    pub async fn request(&mut self, http: &HttpClient, req: ApiRequest) -> Result<HttpResponse, Error> {
        let token = self.access_token(http).await?;
        let response = http.send(&req.clone().bearer(&token)).await?;
        if response.status != 401 {
            return Ok(response);
        }
        self.refresh(http).await?;
        let token = self.access_token(http).await?;
        let response = http.send(&req.bearer(&token)).await?;
        if response.status == 401 {
            return Err(Error::OAuthInvalid);
        }
        Ok(response)
    }

    pub async fn download(
        &mut self,
        http: &HttpClient,
        req: ApiRequest,
        dest: &Path,
    ) -> Result<Download, Error> {
        let token = self.access_token(http).await?;
        let outcome = http.download(&req.clone().bearer(&token), dest).await?;
        if outcome.status != 401 {
            return Ok(outcome);
        }
        self.refresh(http).await?;
        let token = self.access_token(http).await?;
        let outcome = http.download(&req.bearer(&token), dest).await?;
        if outcome.status == 401 {
            return Err(Error::OAuthInvalid);
        }
        Ok(outcome)
    }
}

fn authorization_code(callback_url: &str) -> Result<String, Error> {
    let url = Url::parse(callback_url)
        .or_else(|_| Url::parse(&format!("http://localhost{callback_url}")))
        .map_err(|err| Error::Unknown(format!("invalid callback URL: {err}")))?;
    let mut code = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "error" => {
                warn!(error = %value, "authorization was denied");
                return Err(Error::OAuthInvalid);
            }
            _ => {}
        }
    }
    code.ok_or_else(|| Error::Unknown(anyhow!("callback lacks code parameter").to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> OAuthSession {
        OAuthSession::new(
            OAuthConfig {
                client_id: "client".to_string(),
                client_secret: "secret".to_string(),
                auth_uri: "https://accounts.example.com/o/oauth2/auth".to_string(),
                token_uri: "https://accounts.example.com/token".to_string(),
            },
            None,
            vec!["scope-a".to_string(), "scope-b".to_string()],
            "http://frame.local:7777/callback",
            Arc::new(|_| {}),
        )
    }

    #[test]
    fn authorization_url_carries_state_and_scopes() {
        let url = Url::parse(&session().authorization_url("rid-10.0.0.2-svc1").unwrap()).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("state".to_string(), "rid-10.0.0.2-svc1".to_string())));
        assert!(pairs.contains(&("scope".to_string(), "scope-a scope-b".to_string())));
        assert!(pairs.contains(&("client_id".to_string(), "client".to_string())));
    }

    #[test]
    fn client_json_variants_parse() {
        let wrapped = br#"{"web": {"client_id": "a", "client_secret": "b", "auth_uri": "https://x/auth", "token_uri": "https://x/token"}}"#;
        let config = OAuthConfig::from_client_json(wrapped).unwrap();
        assert_eq!(config.client_id, "a");
        assert!(OAuthConfig::from_client_json(b"{}").is_err());
    }

    #[test]
    fn callback_code_extraction() {
        assert_eq!(
            authorization_code("/callback?state=x&code=abc").unwrap(),
            "abc"
        );
        assert!(matches!(
            authorization_code("/callback?error=access_denied"),
            Err(Error::OAuthInvalid)
        ));
    }

    #[test]
    fn expiry_honours_slack() {
        let token = OAuthToken {
            access_token: "t".to_string(),
            refresh_token: None,
            expires_at: 1_000,
            token_type: None,
            scope: None,
        };
        assert!(!token.is_expired_at(900));
        assert!(token.is_expired_at(950));
    }
}
