// Endpoint derivation
//
// A platform is addressed by one base URL. The socket lives under
// `/platform/subscribe` and the token endpoint under `/oauth/token`,
// both relative to whatever path prefix the base URL carries.

use url::Url;

use crate::error::Error;

const SUBSCRIBE_SUFFIX: &str = "/platform/subscribe";
const TOKEN_SUFFIX: &str = "/oauth/token";

/// The two URLs a session needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub oauth: Url,
    pub websocket: Url,
}

impl Endpoints {
    /// Derive both endpoints from `base`. An explicit `token_url` always wins.
    pub fn derive(base: &Url, token_url: Option<&Url>) -> Result<Self, Error> {
        let oauth = match token_url {
            Some(url) => url.clone(),
            None => oauth_url(base)?,
        };
        Ok(Self {
            oauth,
            websocket: websocket_url(base)?,
        })
    }
}

/// `…/platform/subscribe` over `ws`/`wss`.
pub fn websocket_url(base: &Url) -> Result<Url, Error> {
    if base.path().ends_with(SUBSCRIBE_SUFFIX) {
        return Ok(base.clone());
    }

    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::UnsupportedScheme(other.to_owned()));
        }
    };

    with_suffix(base, scheme, TOKEN_SUFFIX, SUBSCRIBE_SUFFIX)
}

/// `…/oauth/token` over `http`/`https`, whatever the base scheme.
pub fn oauth_url(base: &Url) -> Result<Url, Error> {
    if base.path().ends_with(TOKEN_SUFFIX) {
        return Ok(base.clone());
    }

    let scheme = match base.scheme() {
        "http" | "ws" => "http",
        "https" | "wss" => "https",
        other => {
            return Err(Error::UnsupportedScheme(other.to_owned()));
        }
    };

    with_suffix(base, scheme, SUBSCRIBE_SUFFIX, TOKEN_SUFFIX)
}

/// Rebuild `base` with `scheme`, no query or fragment, and the path
/// prefix followed by `suffix`. A trailing `sibling` suffix (the other
/// endpoint) is dropped so either endpoint can serve as the base.
fn with_suffix(base: &Url, scheme: &str, sibling: &str, suffix: &str) -> Result<Url, Error> {
    let prefix = base.path().trim_end_matches('/');
    let prefix = prefix.strip_suffix(sibling).unwrap_or(prefix);

    let authority = match base.port() {
        Some(port) => format!("{}:{port}", base.host_str().unwrap_or_default()),
        None => base.host_str().unwrap_or_default().to_owned(),
    };

    let mut url = Url::parse(&format!("{scheme}://{authority}{prefix}{suffix}"))?;
    if !base.username().is_empty() {
        // Only a URL without a host refuses credentials.
        let no_host = |()| Error::InvalidUrl(url::ParseError::EmptyHost);
        url.set_username(base.username()).map_err(no_host)?;
        url.set_password(base.password()).map_err(no_host)?;
    }
    Ok(url)
}
