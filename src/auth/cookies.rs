use reqwest::Url;
use reqwest::header::{HeaderMap, SET_COOKIE};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cookie {
    name: String,
    value: String,
    path: String,
    host_only: bool,
}

/// Cookie jars kept per domain scope.
///
/// The identity provider spreads its session over several hosts and path scopes
/// (`identity-myprofile.bosch.com/ids`, `identity.bosch.com/`, `singlekey-id.com`)
/// and answers 400 when a cookie of one scope leaks into a request of another. Jars
/// are therefore kept apart and the matching subset is attached to every request
/// explicitly.
#[derive(Debug, Default, Clone)]
pub(crate) struct CookieJars {
    jars: BTreeMap<String, Vec<Cookie>>,
}

impl CookieJars {
    /// Record every `Set-Cookie` of a response received from `url`.
    pub(crate) fn store(&mut self, url: &Url, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            self.store_one(url, value);
        }
    }

    fn store_one(&mut self, url: &Url, header: &str) {
        let Some(host) = url.host_str() else { return };
        let mut parts = header.split(';');
        let Some((name, value)) = parts.next().and_then(|p| p.split_once('=')) else {
            tracing::debug!(header, "ignoring malformed set-cookie");
            return;
        };
        let (name, value) = (name.trim(), value.trim().trim_matches('"'));
        if name.is_empty() {
            return;
        }
        let mut domain = None;
        let mut path = None;
        let mut expired = false;
        for attr in parts {
            let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
            match key.trim().to_ascii_lowercase().as_str() {
                "domain" => {
                    let d = val.trim().trim_start_matches('.').to_ascii_lowercase();
                    if !d.is_empty() {
                        domain = Some(d);
                    }
                }
                "path" if val.trim().starts_with('/') => path = Some(val.trim().to_string()),
                "max-age" => expired = val.trim().parse::<i64>().is_ok_and(|s| s <= 0),
                _ => {}
            }
        }
        let host_only = domain.is_none();
        let scope = domain.unwrap_or_else(|| host.to_ascii_lowercase());
        let path = path.unwrap_or_else(|| default_path(url));
        let jar = self.jars.entry(scope).or_default();
        jar.retain(|c| !(c.name == name && c.path == path));
        if !expired {
            jar.push(Cookie {
                name: name.to_string(),
                value: value.to_string(),
                path,
                host_only,
            });
        }
    }

    /// Put a cookie into the jar of `scope` by hand (for re-asserting tokens).
    pub(crate) fn insert(&mut self, scope: &str, name: &str, value: &str, path: &str) {
        let jar = self.jars.entry(scope.to_ascii_lowercase()).or_default();
        jar.retain(|c| !(c.name == name && c.path == path));
        jar.push(Cookie {
            name: name.into(),
            value: value.into(),
            path: path.into(),
            host_only: true,
        });
    }

    fn matching<'a>(&'a self, url: &'a Url) -> impl Iterator<Item = &'a Cookie> + 'a {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let path = url.path().to_string();
        self.jars
            .iter()
            .flat_map(move |(scope, jar)| {
                let exact = host == *scope;
                let sub = host.ends_with(&format!(".{scope}"));
                jar.iter()
                    .filter(move |c| exact || (sub && !c.host_only))
            })
            .filter(move |c| path_matches(&path, &c.path))
    }

    /// Value of the `Cookie` header a browser would send to `url`, if any.
    pub(crate) fn header_for(&self, url: &Url) -> Option<String> {
        let mut cookies: Vec<&Cookie> = self.matching(url).collect();
        if cookies.is_empty() {
            return None;
        }
        // Longer paths first, as browsers do.
        cookies.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Some(
            cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Value of cookie `name` as it would be sent to `url`.
    pub(crate) fn value_for(&self, url: &Url, name: &str) -> Option<&str> {
        self.matching(url)
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }

    /// Value of cookie `name` in any jar.
    pub(crate) fn find(&self, name: &str) -> Option<&str> {
        self.jars
            .values()
            .flatten()
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".into(),
        Some(idx) => path[..idx].into(),
    }
}

fn path_matches(request: &str, cookie: &str) -> bool {
    request == cookie
        || (request.starts_with(cookie)
            && (cookie.ends_with('/') || request[cookie.len()..].starts_with('/')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(values: &[&str]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for v in values {
            map.append(SET_COOKIE, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn scopes_do_not_leak_across_hosts() {
        let mut jars = CookieJars::default();
        let profile = Url::parse("https://identity-myprofile.bosch.com/ids/login").unwrap();
        let identity = Url::parse("https://identity.bosch.com/connect/authorize").unwrap();
        let singlekey = Url::parse("https://singlekey-id.com/auth/de-de/login").unwrap();
        jars.store(&profile, &headers(&["idsrv=abc; Path=/ids; Secure; HttpOnly"]));
        jars.store(&identity, &headers(&["bosch=1; Path=/"]));
        jars.store(
            &singlekey,
            &headers(&[
                "XSRF-TOKEN=x1; Path=/",
                "X-CSRF-FORM-TOKEN=f1; Path=/; HttpOnly",
            ]),
        );

        let at_profile = Url::parse("https://identity-myprofile.bosch.com/ids/connect").unwrap();
        assert_eq!(jars.header_for(&at_profile).as_deref(), Some("idsrv=abc"));
        let outside = Url::parse("https://identity-myprofile.bosch.com/other").unwrap();
        assert_eq!(jars.header_for(&outside), None);
        assert_eq!(jars.header_for(&identity).as_deref(), Some("bosch=1"));
        let api = Url::parse("https://singlekey-id.com/auth/api/v1/authentication/login").unwrap();
        let header = jars.header_for(&api).unwrap();
        assert!(header.contains("XSRF-TOKEN=x1"));
        assert!(header.contains("X-CSRF-FORM-TOKEN=f1"));
        assert_eq!(jars.value_for(&api, "XSRF-TOKEN"), Some("x1"));
        assert_eq!(jars.value_for(&identity, "XSRF-TOKEN"), None);
    }

    #[test]
    fn domain_cookies_reach_subdomains_and_expire() {
        let mut jars = CookieJars::default();
        let b2c = Url::parse("https://prodindego.b2clogin.com/x/authorize").unwrap();
        jars.store(&b2c, &headers(&["x-ms-cpim-trans=abc; domain=.b2clogin.com; path=/"]));
        let other = Url::parse("https://login.b2clogin.com/").unwrap();
        assert_eq!(jars.value_for(&other, "x-ms-cpim-trans"), Some("abc"));
        jars.store(&b2c, &headers(&["x-ms-cpim-trans=; domain=.b2clogin.com; path=/; max-age=0"]));
        assert_eq!(jars.find("x-ms-cpim-trans"), None);
    }
}
