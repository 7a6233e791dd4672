//! Browser emulation of the SingleKey-ID sign-in.
//!
//! The sign-in is a fixed sequence of [`Step`]s. Each step names its request
//! (method, URL builder, extra and removed headers, body builder), how redirects
//! are treated and which values are scraped from the outcome. The engine threads a
//! [`Flow`] through the steps, collecting scraped values and cookies as it goes.

use super::cookies::CookieJars;
use super::pkce::{Pkce, random_token};
use crate::http::authority;
use crate::ringlog::{RingLog, stamp};
use base64::Engine as _;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD_NO_PAD};
use base64::engine::{DecodePaddingMode, general_purpose};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::{Method, StatusCode, Url};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

pub(crate) const CLIENT_ID: &str = "65bb8c9d-1070-4fb4-aa95-853618acc876";
pub(crate) const REDIRECT_URI: &str = "com.bosch.indegoconnect://login";
const SCOPE: &str = "openid profile email offline_access \
    https://prodindego.onmicrosoft.com/indego-mobile-api/Indego.Mower.User";
const TENANT: &str = "prodindego.onmicrosoft.com";
const POLICY: &str = "B2C_1A_signup_signin";
pub(crate) const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 11; sdk_gphone_x86_arm) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/83.0.4103.106 Mobile Safari/537.36";
const ACCEPT_DOCUMENT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,\
    image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9";
const ACCEPT_FETCH: &str = "application/json, text/javascript, */*; q=0.01";
const MAX_REDIRECTS: usize = 12;

const TRANS_COOKIE: &str = "x-ms-cpim-trans";
const XSRF_COOKIE: &str = "XSRF-TOKEN";
const FORM_TOKEN_COOKIE: &str = "X-CSRF-FORM-TOKEN";

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    #[error("sign-in step {step} ({name}) could not be sent")]
    Request {
        step: usize,
        name: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("sign-in step {step} ({name}) responded with HTTP {status}")]
    Status {
        step: usize,
        name: &'static str,
        status: StatusCode,
    },
    #[error("sign-in step {step} ({name}) did not yield `{key}`")]
    Missing {
        step: usize,
        name: &'static str,
        key: &'static str,
    },
    #[error("sign-in step {step} ({name}) was redirected more than {MAX_REDIRECTS} times")]
    Redirects { step: usize, name: &'static str },
    #[error("sign-in step {step} ({name}) was redirected to an invalid location")]
    Location { step: usize, name: &'static str },
    #[error("invalid extraction pattern")]
    Pattern(#[source] regex::Error),
}

/// A value a step builder needed but the flow has not collected.
struct Missing(&'static str);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Get,
    Post,
}

impl Verb {
    fn method(self) -> Method {
        match self {
            Verb::Get => Method::GET,
            Verb::Post => Method::POST,
        }
    }
}

/// Which kind of browser request the step imitates; drives `Accept` and `Sec-Fetch-*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Navigate,
    Fetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Redirects {
    Follow,
    Stop,
}

enum Payload {
    None,
    Json(serde_json::Value),
    Form(Vec<(&'static str, String)>),
}

#[derive(Debug, Clone, Copy)]
enum Source {
    /// First capture group of a pattern matched against the response body.
    Body(&'static str),
    /// Cookie value as it would be sent back to the final URL.
    Cookie(&'static str),
    /// Query parameter of the final URL.
    UrlParam(&'static str),
    /// The final URL itself.
    FinalUrl,
    /// `code=` parameter of the `Location` header or, failing that, of the body.
    Code,
}

struct Extract {
    key: &'static str,
    source: Source,
    required: bool,
}

const fn need(key: &'static str, source: Source) -> Extract {
    Extract {
        key,
        source,
        required: true,
    }
}

const fn may(key: &'static str, source: Source) -> Extract {
    Extract {
        key,
        source,
        required: false,
    }
}

type Headers = Vec<(&'static str, String)>;

struct Step {
    name: &'static str,
    verb: Verb,
    mode: Mode,
    url: fn(&Flow) -> Result<Url, Missing>,
    headers: fn(&Flow, &Url) -> Result<Headers, Missing>,
    remove: &'static [&'static str],
    body: fn(&Flow) -> Result<Payload, Missing>,
    redirects: Redirects,
    extract: &'static [Extract],
}

fn no_headers(_: &Flow, _: &Url) -> Result<Headers, Missing> {
    Ok(Vec::new())
}

fn no_body(_: &Flow) -> Result<Payload, Missing> {
    Ok(Payload::None)
}

static STEPS: &[Step] = &[
    Step {
        name: "authorize",
        verb: Verb::Get,
        mode: Mode::Navigate,
        url: |f| Ok(f.authorize_url()),
        headers: no_headers,
        remove: &["origin", "referer"],
        body: no_body,
        redirects: Redirects::Follow,
        extract: &[
            need("csrf", Source::Body(r#""csrf"\s*:\s*"([^"]+)""#)),
            need("page_view_id", Source::Body(r#""pageViewId"\s*:\s*"([^"]+)""#)),
            may("server_nonce", Source::Body(r#"nonce\W{1,4}([A-Za-z0-9+/=_\-]{8,})"#)),
            need("trans", Source::Cookie(TRANS_COOKIE)),
        ],
    },
    Step {
        name: "perftrace",
        verb: Verb::Post,
        mode: Mode::Fetch,
        url: |f| {
            let mut url = f.b2c_url(&format!("{TENANT}/{POLICY}/client/perftrace"));
            url.query_pairs_mut()
                .append_pair("tx", &f.tx()?)
                .append_pair("p", POLICY);
            Ok(url)
        },
        headers: |f, _| Ok(vec![("x-csrf-token", f.value("csrf")?.to_string())]),
        remove: &["upgrade-insecure-requests"],
        body: |f| {
            Ok(Payload::Json(serde_json::json!({
                "navigation": { "type": 0, "redirectCount": 0 },
                "timing": { "connectStart": 0, "responseEnd": 0 },
                "entries": [],
                "connection": { "onLine": true, "effectiveType": "4g" },
                "pageViewId": f.value("page_view_id")?,
            })))
        },
        redirects: Redirects::Stop,
        extract: &[],
    },
    Step {
        name: "unified",
        verb: Verb::Get,
        mode: Mode::Navigate,
        url: |f| {
            let diags = serde_json::json!({
                "pageViewId": f.value("page_view_id")?,
                "pageId": "CombinedSigninAndSignup",
                "trace": [],
            });
            let mut url = f.b2c_url(&format!(
                "{TENANT}/{POLICY}/api/CombinedSigninAndSignup/unified"
            ));
            url.query_pairs_mut()
                .append_pair("claimsexchange", "BoschIDExchange")
                .append_pair("csrf_token", f.value("csrf")?)
                .append_pair("tx", &f.tx()?)
                .append_pair("p", POLICY)
                .append_pair("diags", &diags.to_string());
            Ok(url)
        },
        headers: no_headers,
        remove: &["origin", "x-csrf-token"],
        body: no_body,
        redirects: Redirects::Follow,
        extract: &[
            need("login_page", Source::FinalUrl),
            need("return_url", Source::UrlParam("ReturnUrl")),
        ],
    },
    Step {
        name: "user-exists",
        verb: Verb::Post,
        mode: Mode::Fetch,
        url: |f| f.login_page_join("/auth/api/v1/authentication/UserExists"),
        headers: singlekey_tokens,
        remove: &["upgrade-insecure-requests"],
        body: |f| Ok(Payload::Json(serde_json::json!({ "username": f.user }))),
        redirects: Redirects::Stop,
        extract: &[],
    },
    Step {
        name: "login",
        verb: Verb::Post,
        mode: Mode::Fetch,
        url: |f| f.login_page_join("/auth/api/v1/authentication/login"),
        headers: singlekey_tokens,
        remove: &["upgrade-insecure-requests"],
        body: |f| {
            Ok(Payload::Json(serde_json::json!({
                "username": f.user,
                "password": f.password,
                "keepMeSignedIn": false,
                "returnUrl": f.value("return_url")?,
            })))
        },
        redirects: Redirects::Stop,
        extract: &[],
    },
    Step {
        name: "return",
        verb: Verb::Get,
        mode: Mode::Navigate,
        url: |f| f.login_page_join(f.value("return_url")?),
        headers: no_headers,
        remove: &["origin", "requestverificationtoken", "x-xsrf-token"],
        body: no_body,
        redirects: Redirects::Follow,
        extract: &[
            need("code", Source::Body(r#"name=["']code["'][^>]*?value=["']([^"']+)"#)),
            need("state", Source::Body(r#"name=["']state["'][^>]*?value=["']([^"']+)"#)),
            may(
                "session_state",
                Source::Body(r#"name=["']session_state["'][^>]*?value=["']([^"']+)"#),
            ),
            may("form_action", Source::Body(r#"<form[^>]*?action=["']([^"']+)"#)),
        ],
    },
    Step {
        name: "authresp",
        verb: Verb::Post,
        mode: Mode::Navigate,
        url: |f| match f.values.get("form_action") {
            Some(action) => f.page_join(action),
            None => Ok(f.b2c_url(&format!("{TENANT}/oauth2/authresp"))),
        },
        headers: |_, _| Ok(vec![("cache-control", "max-age=0".into())]),
        remove: &[],
        body: |f| {
            Ok(Payload::Form(vec![
                ("code", f.value("code")?.to_string()),
                ("state", f.value("state")?.to_string()),
                (
                    "session_state",
                    f.values.get("session_state").cloned().unwrap_or_default(),
                ),
            ]))
        },
        redirects: Redirects::Follow,
        extract: &[need("authorization_code", Source::Code)],
    },
];

/// The anti-forgery pair the credential API insists on.
fn singlekey_tokens(f: &Flow, url: &Url) -> Result<Headers, Missing> {
    let form = f
        .jars
        .value_for(url, FORM_TOKEN_COOKIE)
        .ok_or(Missing(FORM_TOKEN_COOKIE))?;
    let mut headers = vec![("requestverificationtoken", form.to_string())];
    if let Some(xsrf) = f.jars.value_for(url, XSRF_COOKIE) {
        headers.push(("x-xsrf-token", xsrf.to_string()));
    }
    Ok(headers)
}

/// Values collected while walking through the sign-in.
pub(crate) struct Flow<'a> {
    b2c: &'a Url,
    user: &'a str,
    password: &'a str,
    pub(crate) pkce: Pkce,
    state: String,
    nonce: String,
    values: BTreeMap<&'static str, String>,
    jars: CookieJars,
    /// Document the emulated browser currently shows.
    page: Option<Url>,
}

impl<'a> Flow<'a> {
    pub(crate) fn new(b2c: &'a Url, user: &'a str, password: &'a str) -> Self {
        Self {
            b2c,
            user,
            password,
            pkce: Pkce::generate(),
            state: random_token(16),
            nonce: random_token(16),
            values: BTreeMap::new(),
            jars: CookieJars::default(),
            page: None,
        }
    }

    /// The authorization code the identity provider handed back.
    pub(crate) fn authorization_code(&self) -> Option<&str> {
        self.values.get("authorization_code").map(String::as_str)
    }

    fn value(&self, key: &'static str) -> Result<&str, Missing> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or(Missing(key))
    }

    fn b2c_url(&self, path: &str) -> Url {
        let mut url = self.b2c.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/{path}"));
        url.set_query(None);
        url
    }

    fn authorize_url(&self) -> Url {
        let mut url = self.b2c_url(&format!(
            "{TENANT}/{}/oauth2/v2.0/authorize",
            POLICY.to_ascii_lowercase()
        ));
        url.query_pairs_mut()
            .append_pair("redirect_uri", REDIRECT_URI)
            .append_pair("client_id", CLIENT_ID)
            .append_pair("response_type", "code")
            .append_pair("state", &self.state)
            .append_pair("nonce", &self.nonce)
            .append_pair("scope", SCOPE)
            .append_pair("code_challenge", &self.pkce.challenge)
            .append_pair("code_challenge_method", "S256");
        url
    }

    fn login_page_join(&self, path: &str) -> Result<Url, Missing> {
        let page = Url::parse(self.value("login_page")?).map_err(|_| Missing("login_page"))?;
        page.join(path).map_err(|_| Missing("login_page"))
    }

    fn page_join(&self, path: &str) -> Result<Url, Missing> {
        let page = self.page.as_ref().ok_or(Missing("page"))?;
        page.join(path).map_err(|_| Missing("page"))
    }

    /// `StateProperties=<token>` derived from the transaction cookie: its `C_ID`
    /// re-encoded as `{"TID":...}` without padding.
    fn tx(&self) -> Result<String, Missing> {
        let cookie = self.value("trans")?;
        transaction_state(cookie)
            .map(|token| format!("StateProperties={token}"))
            .ok_or(Missing("trans"))
    }
}

fn transaction_state(cookie: &str) -> Option<String> {
    const LENIENT: GeneralPurpose = GeneralPurpose::new(
        &base64::alphabet::STANDARD,
        GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
    );
    let raw = LENIENT
        .decode(cookie)
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(cookie.trim_end_matches('=')))
        .ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    let id = value.get("C_ID")?.as_str()?;
    let tid = serde_json::json!({ "TID": id }).to_string();
    Some(STANDARD_NO_PAD.encode(tid))
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

/// Registrable part of a host, good enough for the hosts involved here.
fn site(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let labels: Vec<&str> = host.rsplitn(3, '.').collect();
    match labels.as_slice() {
        [tld, name, ..] => format!("{name}.{tld}"),
        _ => host.to_string(),
    }
}

fn fetch_site(initiator: Option<&Url>, target: &Url) -> &'static str {
    match initiator {
        None => "none",
        Some(from) if same_origin(from, target) => "same-origin",
        Some(from) if site(from) == site(target) => "same-site",
        Some(_) => "cross-site",
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(HeaderName::from_static(name), v);
        }
        Err(_) => tracing::debug!(header = name, "dropping a header with an invalid value"),
    }
}

fn browser_headers(
    step: &Step,
    flow: &Flow,
    url: &Url,
    verb: Verb,
    initiator: Option<&Url>,
    extra: &Headers,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(host) = authority(url) {
        insert(&mut headers, "host", &host);
    }
    insert(&mut headers, "accept-language", "en-US,en;q=0.9");
    insert(&mut headers, "sec-fetch-site", fetch_site(initiator, url));
    match step.mode {
        Mode::Navigate => {
            insert(&mut headers, "accept", ACCEPT_DOCUMENT);
            insert(&mut headers, "sec-fetch-mode", "navigate");
            insert(&mut headers, "sec-fetch-dest", "document");
            insert(&mut headers, "sec-fetch-user", "?1");
            insert(&mut headers, "upgrade-insecure-requests", "1");
        }
        Mode::Fetch => {
            insert(&mut headers, "accept", ACCEPT_FETCH);
            insert(&mut headers, "sec-fetch-mode", "cors");
            insert(&mut headers, "sec-fetch-dest", "empty");
            insert(&mut headers, "x-requested-with", "XMLHttpRequest");
        }
    }
    if verb == Verb::Post {
        let origin = initiator.unwrap_or(url).origin().ascii_serialization();
        insert(&mut headers, "origin", &origin);
    }
    if let Some(referer) = initiator {
        insert(&mut headers, "referer", referer.as_str());
    }
    if let Some(cookies) = flow.jars.header_for(url) {
        insert(&mut headers, "cookie", &cookies);
    }
    for (name, value) in extra {
        insert(&mut headers, name, value);
    }
    for name in step.remove {
        headers.remove(*name);
    }
    headers
}

struct Outcome {
    url: Url,
    location: Option<String>,
    body: String,
}

/// Walk the whole sign-in. On success the flow holds the authorization code.
pub(crate) async fn run(
    client: &reqwest::Client,
    flow: &mut Flow<'_>,
    comm_log: &Mutex<RingLog>,
) -> Result<(), Error> {
    for (index, step) in STEPS.iter().enumerate() {
        let outcome = match execute(client, flow, comm_log, index, step).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    step = index,
                    name = step.name,
                    error = &e as &dyn std::error::Error,
                    "sign-in step failed"
                );
                return Err(e);
            }
        };
        for extract in step.extract {
            match scrape(flow, &outcome, extract.source)? {
                Some(value) => {
                    flow.values.insert(extract.key, value);
                }
                None if extract.required => {
                    tracing::warn!(step = index, name = step.name, key = extract.key, "value not found");
                    return Err(Error::Missing {
                        step: index,
                        name: step.name,
                        key: extract.key,
                    });
                }
                None => tracing::debug!(step = index, key = extract.key, "optional value not found"),
            }
        }
        if step.mode == Mode::Navigate {
            flow.page = Some(outcome.url);
        }
        tracing::debug!(step = index, name = step.name, "sign-in step done");
    }
    Ok(())
}

async fn execute(
    client: &reqwest::Client,
    flow: &mut Flow<'_>,
    comm_log: &Mutex<RingLog>,
    index: usize,
    step: &Step,
) -> Result<Outcome, Error> {
    let missing = |Missing(key)| Error::Missing {
        step: index,
        name: step.name,
        key,
    };
    let mut url = (step.url)(flow).map_err(missing)?;
    let mut payload = (step.body)(flow).map_err(missing)?;
    let mut verb = step.verb;
    let mut initiator = flow.page.clone();
    for hop in 0..MAX_REDIRECTS {
        let extra = (step.headers)(flow, &url).map_err(missing)?;
        let headers = browser_headers(step, flow, &url, verb, initiator.as_ref(), &extra);
        let mut request = client.request(verb.method(), url.clone()).headers(headers);
        request = match std::mem::replace(&mut payload, Payload::None) {
            Payload::None => request,
            Payload::Json(value) => request.json(&value),
            Payload::Form(fields) => request.form(&fields),
        };
        let response = request.send().await.map_err(|source| Error::Request {
            step: index,
            name: step.name,
            source,
        })?;
        let status = response.status();
        comm_log.lock().await.push(format!(
            "{} {:<6} {} {}",
            stamp(),
            verb.method().as_str(),
            status.as_str(),
            url
        ));
        flow.jars.store(&url, response.headers());
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if status.is_redirection() {
            if let Some(location) = &location {
                let next = url.join(location).map_err(|_| Error::Location {
                    step: index,
                    name: step.name,
                })?;
                let web = matches!(next.scheme(), "http" | "https");
                if step.redirects == Redirects::Follow && web {
                    tracing::debug!(step = index, hop, from = %url, to = %next, "following redirect");
                    if !matches!(
                        status,
                        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
                    ) {
                        verb = Verb::Get;
                    }
                    initiator = Some(url);
                    url = next;
                    continue;
                }
            }
        }
        let body = response.text().await.unwrap_or_default();
        let accepted = status.is_success()
            || (status.is_redirection()
                && (step.redirects == Redirects::Stop || location.is_some()));
        if !accepted {
            return Err(Error::Status {
                step: index,
                name: step.name,
                status,
            });
        }
        return Ok(Outcome {
            url,
            location,
            body,
        });
    }
    Err(Error::Redirects {
        step: index,
        name: step.name,
    })
}

fn capture(pattern: &str, haystack: &str) -> Result<Option<String>, Error> {
    let re = Regex::new(pattern).map_err(Error::Pattern)?;
    Ok(re
        .captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().replace("&amp;", "&")))
}

fn scrape(flow: &Flow, outcome: &Outcome, source: Source) -> Result<Option<String>, Error> {
    Ok(match source {
        Source::Body(pattern) => capture(pattern, &outcome.body)?,
        Source::Cookie(name) => flow
            .jars
            .value_for(&outcome.url, name)
            .or_else(|| flow.jars.find(name))
            .map(str::to_string),
        Source::UrlParam(name) => outcome
            .url
            .query_pairs()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.into_owned()),
        Source::FinalUrl => Some(outcome.url.to_string()),
        Source::Code => {
            const CODE: &str = r#"[?&#;]code=([^&"'\s<]+)"#;
            let from_location = match outcome.location.as_deref() {
                Some(location) => capture(CODE, location)?,
                None => None,
            };
            match from_location {
                Some(code) => Some(code),
                None => capture(CODE, &outcome.body)?,
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};

    /// `{"C_ID":"8912c0e6-defb-4d58-858b-27d1cfbbe8f5"}`
    pub(crate) const TRANS: &str = "eyJDX0lEIjoiODkxMmMwZTYtZGVmYi00ZDU4LTg1OGItMjdkMWNmYmJlOGY1In0=";

    #[test]
    fn transaction_cookie_is_re_encoded() {
        assert_eq!(
            transaction_state(TRANS).as_deref(),
            Some("eyJUSUQiOiI4OTEyYzBlNi1kZWZiLTRkNTgtODU4Yi0yN2QxY2ZiYmU4ZjUifQ")
        );
        assert_eq!(transaction_state("not base64!"), None);
    }

    #[test]
    fn fetch_site_classification() {
        let b2c = Url::parse("https://prodindego.b2clogin.com/a").unwrap();
        let b2c2 = Url::parse("https://prodindego.b2clogin.com/b").unwrap();
        let ids = Url::parse("https://identity.bosch.com/x").unwrap();
        let profile = Url::parse("https://identity-myprofile.bosch.com/ids").unwrap();
        assert_eq!(fetch_site(None, &b2c), "none");
        assert_eq!(fetch_site(Some(&b2c), &b2c2), "same-origin");
        assert_eq!(fetch_site(Some(&ids), &profile), "same-site");
        assert_eq!(fetch_site(Some(&b2c), &ids), "cross-site");
    }

    /// Mount a complete happy-path identity provider on `server`.
    pub(crate) async fn mount_identity_provider(server: &mut ServerGuard) -> Vec<mockito::Mock> {
        let base = server.url();
        let mut mocks = Vec::new();
        mocks.push(
            server
                .mock(
                    "GET",
                    "/prodindego.onmicrosoft.com/b2c_1a_signup_signin/oauth2/v2.0/authorize",
                )
                .match_query(Matcher::AllOf(vec![
                    Matcher::UrlEncoded("client_id".into(), CLIENT_ID.into()),
                    Matcher::UrlEncoded("code_challenge_method".into(), "S256".into()),
                ]))
                .with_status(200)
                .with_header("content-type", "text/html")
                .with_header("set-cookie", &format!("{TRANS_COOKIE}={TRANS}; path=/"))
                .with_body(
                    r#"<script>var SETTINGS = {"csrf":"Q1NSRg==","pageViewId":"pv-1","nonce":"c2VydmVybm9uY2U="};</script>"#,
                )
                .create_async()
                .await,
        );
        mocks.push(
            server
                .mock("POST", "/prodindego.onmicrosoft.com/B2C_1A_signup_signin/client/perftrace")
                .match_query(Matcher::Any)
                .match_header("x-csrf-token", "Q1NSRg==")
                .match_header("sec-fetch-site", "same-origin")
                .match_body(Matcher::PartialJsonString(r#"{"pageViewId":"pv-1"}"#.into()))
                .with_status(200)
                .create_async()
                .await,
        );
        mocks.push(
            server
                .mock(
                    "GET",
                    "/prodindego.onmicrosoft.com/B2C_1A_signup_signin/api/CombinedSigninAndSignup/unified",
                )
                .match_query(Matcher::UrlEncoded("claimsexchange".into(), "BoschIDExchange".into()))
                .with_status(302)
                .with_header("location", "/connect/authorize?client_id=ciamids")
                .create_async()
                .await,
        );
        mocks.push(
            server
                .mock("GET", "/connect/authorize")
                .match_query(Matcher::Any)
                .with_status(302)
                .with_header(
                    "location",
                    "/auth/de-de/log-in?ReturnUrl=%2Fauth%2Fconnect%2Fauthorize%2Fcallback%3Fx%3D1",
                )
                .create_async()
                .await,
        );
        mocks.push(
            server
                .mock("GET", "/auth/de-de/log-in")
                .match_query(Matcher::Any)
                .with_status(200)
                .with_header("content-type", "text/html")
                .with_header("set-cookie", "XSRF-TOKEN=xsrf-1; path=/")
                .with_header("set-cookie", "X-CSRF-FORM-TOKEN=form-1; path=/; httponly")
                .with_body("<html>login</html>")
                .create_async()
                .await,
        );
        for path in ["UserExists", "login"] {
            mocks.push(
                server
                    .mock("POST", format!("/auth/api/v1/authentication/{path}").as_str())
                    .match_header("requestverificationtoken", "form-1")
                    .match_header("x-xsrf-token", "xsrf-1")
                    .match_header("cookie", Matcher::Regex("X-CSRF-FORM-TOKEN=form-1".into()))
                    .with_status(200)
                    .with_header("content-type", "application/json")
                    .with_body("{}")
                    .create_async()
                    .await,
            );
        }
        mocks.push(
            server
                .mock("GET", "/auth/connect/authorize/callback")
                .match_query(Matcher::UrlEncoded("x".into(), "1".into()))
                .with_status(200)
                .with_header("content-type", "text/html")
                .with_body(format!(
                    r#"<form method="post" action="{base}/prodindego.onmicrosoft.com/oauth2/authresp">
                    <input type="hidden" name="code" value="idp-code" />
                    <input type="hidden" name="state" value="StateProperties=abc" />
                    <input type="hidden" name="session_state" value="sess" /></form>"#
                ))
                .create_async()
                .await,
        );
        mocks.push(
            server
                .mock("POST", "/prodindego.onmicrosoft.com/oauth2/authresp")
                .match_body(Matcher::AllOf(vec![
                    Matcher::UrlEncoded("code".into(), "idp-code".into()),
                    Matcher::UrlEncoded("session_state".into(), "sess".into()),
                ]))
                .with_status(302)
                .with_header("location", "com.bosch.indegoconnect://login?state=s&code=final-code")
                .create_async()
                .await,
        );
        mocks
    }

    #[tokio::test]
    async fn walks_all_steps() {
        let mut server = Server::new_async().await;
        let mocks = mount_identity_provider(&mut server).await;
        let b2c = Url::parse(&format!("{}/", server.url())).unwrap();
        let client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        let log = Mutex::new(RingLog::default());
        let mut flow = Flow::new(&b2c, "u@example.com", "pw");
        run(&client, &mut flow, &log).await.unwrap();
        assert_eq!(flow.authorization_code(), Some("final-code"));
        assert!(log.lock().await.len() >= STEPS.len());
        for mock in mocks {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn failing_step_is_reported_by_index() {
        let mut server = Server::new_async().await;
        server
            .mock(
                "GET",
                "/prodindego.onmicrosoft.com/b2c_1a_signup_signin/oauth2/v2.0/authorize",
            )
            .match_query(Matcher::Any)
            .with_status(400)
            .create_async()
            .await;
        let b2c = Url::parse(&format!("{}/", server.url())).unwrap();
        let client = reqwest::Client::new();
        let log = Mutex::new(RingLog::default());
        let mut flow = Flow::new(&b2c, "u", "p");
        let err = run(&client, &mut flow, &log).await.unwrap_err();
        assert!(matches!(err, Error::Status { step: 0, .. }));
        assert_eq!(flow.authorization_code(), None);
    }
}
