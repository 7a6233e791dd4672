//! Identity client: SingleKey-ID sign-in, token exchange and refresh.

mod cookies;
pub(crate) mod flow;
mod pkce;

use crate::http::{Body, DEFAULT_TIMEOUT, Transport, authority, endpoint};
use crate::ringlog::stamp;
use crate::schemas;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::{StatusCode, Url};
use std::time::Duration;
use tokio::sync::Mutex;

const TOKEN_USER_AGENT: &str =
    "Dalvik/2.1.0 (Linux; U; Android 11; sdk_gphone_x86_arm Build/RSR1.201013.001)";
const CONNECT_TIMEOUT: Duration = Duration::new(3, 0);
const FLOW_TIMEOUT: Duration = Duration::new(30, 0);
/// The bearer is renewed this long before it expires.
pub(crate) const REFRESH_HEADROOM: Duration = Duration::new(100, 0);
const MIN_REFRESH_PERIOD: Duration = Duration::new(60, 0);
const LOGIN_WAIT: Duration = Duration::new(2, 0);
const LOGIN_WAIT_RETRIES: u32 = 2;

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    #[error("could not build the identity HTTP client")]
    BuildClient(#[source] reqwest::Error),
    #[error("the stored credentials are not base64 encoded `user:password`")]
    Credentials,
    #[error("the interactive sign-in failed")]
    Flow(#[source] flow::Error),
    #[error("the identity provider issued no authorization code")]
    NoCode,
    #[error("could not reach the token endpoint")]
    TokenRequest(#[source] reqwest::Error),
    #[error("the token endpoint responded with HTTP {0}")]
    TokenStatus(StatusCode),
    #[error("could not decode the token response")]
    TokenDecode(#[source] reqwest::Error),
    #[error("no refresh token is held")]
    NoRefreshToken,
    #[error("could not list the mowers of the account")]
    Alms(#[source] crate::http::Error),
    #[error("the account has no mower")]
    NoMower,
    #[error("another sign-in or refresh is in progress")]
    Busy,
}

impl Error {
    /// The token endpoint refused the grant, as opposed to being unreachable.
    pub(crate) fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::TokenStatus(
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            )
        )
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub(crate) struct Credentials {
    pub(crate) user: String,
    pub(crate) password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Decode the `base64(user:password)` form credentials are stored in.
    pub(crate) fn decode(encoded: &str) -> Result<Self, Error> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|_| Error::Credentials)?;
        let raw = String::from_utf8(raw).map_err(|_| Error::Credentials)?;
        let (user, password) = raw.split_once(':').ok_or(Error::Credentials)?;
        Ok(Self {
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    pub(crate) fn encode(&self) -> String {
        STANDARD.encode(format!("{}:{}", self.user, self.password))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Phase {
    #[default]
    Anonymous,
    LoggingIn,
    LoggedIn,
    Refreshing,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Session {
    pub(crate) bearer: String,
    refresh_token: String,
    pub(crate) ttl: Duration,
    pub(crate) expiry: Option<jiff::Timestamp>,
    pub(crate) last_login: Option<jiff::Timestamp>,
    pub(crate) serial: String,
    pub(crate) phase: Phase,
    /// An API call was rejected; renew before the next job runs.
    pub(crate) force_refresh: bool,
}

impl Session {
    pub(crate) fn logged_in(&self) -> bool {
        matches!(self.phase, Phase::LoggedIn | Phase::Refreshing) && !self.bearer.is_empty()
    }

    pub(crate) fn login_pending(&self) -> bool {
        matches!(self.phase, Phase::LoggingIn | Phase::Refreshing)
    }

    /// How often the refresh job should run for the current token.
    pub(crate) fn refresh_period(&self) -> Duration {
        self.ttl
            .saturating_sub(REFRESH_HEADROOM)
            .max(MIN_REFRESH_PERIOD)
    }

    fn accept(&mut self, token: schemas::oauth::TokenResponse) {
        let now = jiff::Timestamp::now();
        self.ttl = Duration::try_from_secs_f64(token.expires_in).unwrap_or_default();
        self.bearer = token.access_token;
        if let Some(refresh) = token.refresh_token {
            self.refresh_token = refresh;
        }
        self.last_login = Some(now);
        self.expiry = jiff::SignedDuration::try_from(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add(ttl).ok());
        self.phase = Phase::LoggedIn;
        self.force_refresh = false;
    }
}

/// Owns the session. Only this type mutates it; everybody else reads snapshots.
pub(crate) struct Identity {
    browser: reqwest::Client,
    token: reqwest::Client,
    b2c: Url,
    api_base: Url,
    transport: Transport,
    session: Mutex<Session>,
    gate: Mutex<()>,
}

impl Identity {
    pub(crate) fn new(b2c: Url, api_base: Url, transport: Transport) -> Result<Self, Error> {
        let browser = reqwest::ClientBuilder::new()
            .user_agent(flow::BROWSER_USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(FLOW_TIMEOUT)
            .gzip(true)
            .build()
            .map_err(Error::BuildClient)?;
        let token = reqwest::ClientBuilder::new()
            .user_agent(TOKEN_USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(FLOW_TIMEOUT)
            .gzip(true)
            .build()
            .map_err(Error::BuildClient)?;
        Ok(Self {
            browser,
            token,
            b2c,
            api_base,
            transport,
            session: Mutex::new(Session::default()),
            gate: Mutex::new(()),
        })
    }

    pub(crate) async fn session(&self) -> Session {
        self.session.lock().await.clone()
    }

    /// Session snapshot once no sign-in is in flight. Gives up waiting after a
    /// couple of short sleeps and hands out whatever is current.
    pub(crate) async fn ready_session(&self) -> Session {
        for _ in 0..LOGIN_WAIT_RETRIES {
            {
                let session = self.session.lock().await;
                if !session.login_pending() {
                    return session.clone();
                }
            }
            tracing::debug!("waiting for a pending sign-in");
            tokio::time::sleep(LOGIN_WAIT).await;
        }
        self.session.lock().await.clone()
    }

    /// Note that the vendor rejected the bearer.
    pub(crate) async fn invalidate(&self) {
        let mut session = self.session.lock().await;
        if !session.force_refresh {
            tracing::info!("bearer rejected, renewing before the next job");
        }
        session.force_refresh = true;
    }

    pub(crate) async fn logout(&self) {
        *self.session.lock().await = Session::default();
    }

    pub(crate) async fn login(&self, credentials: &Credentials) -> Result<(), Error> {
        let Ok(_gate) = self.gate.try_lock() else {
            return Err(Error::Busy);
        };
        self.session.lock().await.phase = Phase::LoggingIn;
        let result = self.sign_in(credentials).await;
        let mut session = self.session.lock().await;
        match result {
            Ok((token, serial)) => {
                session.accept(token);
                tracing::info!(%serial, ttl = ?session.ttl, "logged in");
                session.serial = serial;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = &e as &dyn std::error::Error, "login failed");
                *session = Session::default();
                Err(e)
            }
        }
    }

    async fn sign_in(
        &self,
        credentials: &Credentials,
    ) -> Result<(schemas::oauth::TokenResponse, String), Error> {
        let mut flow = flow::Flow::new(&self.b2c, &credentials.user, &credentials.password);
        flow::run(&self.browser, &mut flow, self.transport.comm_log())
            .await
            .map_err(Error::Flow)?;
        let code = flow.authorization_code().ok_or(Error::NoCode)?.to_string();
        let token = self
            .token_request(&[
                ("code", code.as_str()),
                ("grant_type", "authorization_code"),
                ("redirect_uri", flow::REDIRECT_URI),
                ("code_verifier", flow.pkce.verifier.as_str()),
                ("client_id", flow::CLIENT_ID),
            ])
            .await?;
        let serial = self.fetch_serial(&token.access_token).await?;
        Ok((token, serial))
    }

    /// Renew the bearer through the token endpoint only.
    pub(crate) async fn refresh(&self) -> Result<(), Error> {
        let Ok(_gate) = self.gate.try_lock() else {
            return Err(Error::Busy);
        };
        let previous;
        let refresh_token = {
            let mut session = self.session.lock().await;
            if session.refresh_token.is_empty() {
                return Err(Error::NoRefreshToken);
            }
            previous = session.phase;
            session.phase = Phase::Refreshing;
            session.refresh_token.clone()
        };
        let result = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", flow::CLIENT_ID),
            ])
            .await;
        let mut session = self.session.lock().await;
        match result {
            Ok(token) => {
                session.accept(token);
                tracing::info!(expiry = ?session.expiry, "bearer refreshed");
                Ok(())
            }
            Err(e) if e.is_rejection() => {
                tracing::warn!(error = &e as &dyn std::error::Error, "refresh token rejected");
                *session = Session::default();
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = &e as &dyn std::error::Error, "token refresh failed");
                session.phase = previous;
                Err(e)
            }
        }
    }

    fn token_url(&self) -> Url {
        let mut url = self.b2c.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!(
            "{base}/prodindego.onmicrosoft.com/b2c_1a_signup_signin/oauth2/v2.0/token"
        ));
        url
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
    ) -> Result<schemas::oauth::TokenResponse, Error> {
        let url = self.token_url();
        let mut request = self
            .token
            .post(url.clone())
            .header("accept", "application/json")
            .header("accept-encoding", "gzip")
            .header("connection", "Keep-Alive")
            .form(form);
        if let Some(host) = authority(&url) {
            request = request.header("host", host);
        }
        let response = request.send().await.map_err(Error::TokenRequest)?;
        let status = response.status();
        self.transport
            .comm_log()
            .lock()
            .await
            .push(format!("{} {:<6} {} {}", stamp(), "POST", status.as_str(), url));
        if !status.is_success() {
            return Err(Error::TokenStatus(status));
        }
        response
            .json::<schemas::oauth::TokenResponse>()
            .await
            .map_err(Error::TokenDecode)
    }

    async fn fetch_serial(&self, bearer: &str) -> Result<String, Error> {
        let url = endpoint(&self.api_base, "alms").map_err(Error::Alms)?;
        let body = self
            .transport
            .get(&url, bearer, DEFAULT_TIMEOUT)
            .await
            .map_err(Error::Alms)?;
        let Body::Json(value) = body else {
            return Err(Error::NoMower);
        };
        let alms: Vec<schemas::indego::Alm> = serde_json::from_value(value)
            .map_err(|e| Error::Alms(crate::http::Error::Decode(e, url.to_string())))?;
        alms.into_iter()
            .next()
            .map(|alm| alm.alm_sn)
            .ok_or(Error::NoMower)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ringlog::RingLog;
    use mockito::{Matcher, Server, ServerGuard};
    use std::sync::Arc;

    pub(crate) const TOKEN_PATH: &str =
        "/prodindego.onmicrosoft.com/b2c_1a_signup_signin/oauth2/v2.0/token";

    pub(crate) fn identity(server: &ServerGuard) -> Identity {
        let transport = Transport::new(Arc::new(Mutex::new(RingLog::default()))).unwrap();
        Identity::new(
            Url::parse(&format!("{}/", server.url())).unwrap(),
            Url::parse(&format!("{}/api/v1/", server.url())).unwrap(),
            transport,
        )
        .unwrap()
    }

    /// Bring `identity` into the logged-in state without walking the sign-in.
    pub(crate) async fn force_login(identity: &Identity, bearer: &str, serial: &str) {
        let mut session = identity.session.lock().await;
        session.accept(schemas::oauth::TokenResponse {
            access_token: bearer.into(),
            refresh_token: Some("refresh-1".into()),
            expires_in: 3600.0,
        });
        session.serial = serial.into();
    }

    #[test]
    fn credentials_round_trip() {
        let creds = Credentials {
            user: "u@example.com".into(),
            password: "p:w".into(),
        };
        assert_eq!(Credentials::decode(&creds.encode()).unwrap(), creds);
        assert!(Credentials::decode("bm9jb2xvbg==").is_err());
        assert!(!format!("{creds:?}").contains("p:w"));
    }

    #[tokio::test]
    async fn cold_login() {
        let mut server = Server::new_async().await;
        let _flow = flow::tests::mount_identity_provider(&mut server).await;
        let token = server
            .mock("POST", TOKEN_PATH)
            .match_header("user-agent", TOKEN_USER_AGENT)
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "final-code".into()),
                Matcher::UrlEncoded("redirect_uri".into(), flow::REDIRECT_URI.into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"bearer-1","refresh_token":"refresh-1","expires_in":3600}"#)
            .create_async()
            .await;
        let alms = server
            .mock("GET", "/api/v1/alms")
            .match_header("authorization", "Bearer bearer-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"alm_sn":"603702021"}]"#)
            .create_async()
            .await;
        let identity = identity(&server);
        let credentials = Credentials {
            user: "u@example.com".into(),
            password: "pw".into(),
        };
        identity.login(&credentials).await.unwrap();
        let session = identity.session().await;
        assert!(session.logged_in());
        assert!(!session.login_pending());
        assert_eq!(session.bearer, "bearer-1");
        assert_eq!(session.serial, "603702021");
        assert!(session.expiry.unwrap() > jiff::Timestamp::now());
        token.assert_async().await;
        alms.assert_async().await;
    }

    #[tokio::test]
    async fn failed_login_stays_anonymous() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", Matcher::Any)
            .with_status(500)
            .create_async()
            .await;
        let identity = identity(&server);
        let credentials = Credentials::default();
        assert!(identity.login(&credentials).await.is_err());
        let session = identity.session().await;
        assert_eq!(session.phase, Phase::Anonymous);
        assert!(session.bearer.is_empty());
        assert!(session.serial.is_empty());
    }

    #[tokio::test]
    async fn refresh_moves_expiry_forward() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", TOKEN_PATH)
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"bearer-2","refresh_token":"refresh-2","expires_in":3600}"#)
            .create_async()
            .await;
        let identity = identity(&server);
        force_login(&identity, "bearer-1", "603702021").await;
        identity.invalidate().await;
        identity.refresh().await.unwrap();
        let session = identity.session().await;
        let left = session.expiry.unwrap().duration_since(jiff::Timestamp::now());
        assert!(left.as_secs() >= 3600 - 5);
        assert_eq!(session.bearer, "bearer-2");
        assert!(!session.force_refresh);
        assert_eq!(session.refresh_period(), Duration::from_secs(3500));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_token_endpoint_keeps_the_session() {
        let mut server = Server::new_async().await;
        let unavailable = server
            .mock("POST", TOKEN_PATH)
            .with_status(503)
            .create_async()
            .await;
        let identity = identity(&server);
        force_login(&identity, "bearer-1", "603702021").await;
        assert!(identity.refresh().await.is_err());
        unavailable.remove_async().await;
        let session = identity.session().await;
        assert!(session.logged_in());
        assert_eq!(session.serial, "603702021");
        assert_eq!(session.refresh_token, "refresh-1");

        let rejected = server
            .mock("POST", TOKEN_PATH)
            .with_status(401)
            .create_async()
            .await;
        assert!(identity.refresh().await.unwrap_err().is_rejection());
        rejected.assert_async().await;
        let session = identity.session().await;
        assert!(!session.logged_in());
        assert!(session.serial.is_empty());
    }
}
