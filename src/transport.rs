use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::domain::{Credentials, SourceLocator};
use crate::error::{FetchError, NimbusError};

/// An opened remote artifact: its declared size and a body still to be read.
pub struct RemotePayload {
    pub declared_len: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl RemotePayload {
    pub fn new(declared_len: Option<u64>, body: impl Read + Send + 'static) -> Self {
        Self {
            declared_len,
            body: Box::new(body),
        }
    }
}

pub trait RemoteSource: Send + Sync {
    /// Opens `locator`, returning once the remote has declared the payload size.
    fn open(
        &self,
        locator: &SourceLocator,
        credentials: Option<&Credentials>,
    ) -> Result<RemotePayload, FetchError>;
}

/// Redirect hops followed with credentials re-attached before giving up.
pub const MAX_AUTH_REDIRECTS: usize = 10;

#[derive(Clone)]
pub struct HttpSource {
    client: Client,
    auth_client: Client,
}

impl HttpSource {
    pub fn new() -> Result<Self, NimbusError> {
        Ok(Self {
            client: Self::build_client(false)?,
            auth_client: Self::build_client(true)?,
        })
    }

    // Large model files: only connecting is bounded, the transfer itself is not.
    // The authenticated client follows redirects itself so the credentials go
    // along to every hop, including cross-host ones.
    fn build_client(authenticated: bool) -> Result<Client, NimbusError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("nimbus-fetch/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| NimbusError::Http(err.to_string()))?,
        );
        Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .cookie_store(authenticated)
            .redirect(if authenticated {
                Policy::none()
            } else {
                Policy::default()
            })
            .build()
            .map_err(|err| NimbusError::Http(err.to_string()))
    }

    fn handle_status(locator: &SourceLocator, response: Response) -> Result<Response, FetchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(locator.to_string()));
        }
        Err(FetchError::Status {
            status: status.as_u16(),
            locator: locator.to_string(),
        })
    }

    fn send_authenticated(
        &self,
        locator: &SourceLocator,
        creds: &Credentials,
    ) -> Result<Response, FetchError> {
        let mut url = Url::parse(locator.as_str())
            .map_err(|err| FetchError::Http(format!("invalid url {locator}: {err}")))?;
        for _ in 0..=MAX_AUTH_REDIRECTS {
            let response = self
                .auth_client
                .get(url.clone())
                .basic_auth(creds.user(), Some(creds.password()))
                .send()
                .map_err(|err| FetchError::Http(err.to_string()))?;
            if !response.status().is_redirection() {
                return Ok(response);
            }
            let Some(next) = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
            else {
                return Ok(response);
            };
            url = response
                .url()
                .join(next)
                .map_err(|err| FetchError::Http(format!("bad redirect {next:?}: {err}")))?;
            debug!(%locator, hop = %url, "following authenticated redirect");
        }
        Err(FetchError::Http(format!("too many redirects for {locator}")))
    }
}

impl RemoteSource for HttpSource {
    fn open(
        &self,
        locator: &SourceLocator,
        credentials: Option<&Credentials>,
    ) -> Result<RemotePayload, FetchError> {
        // Authenticated hosts often bounce through a login host that sets a
        // session cookie before sending the client back.
        let response = match credentials {
            Some(creds) => self.send_authenticated(locator, creds)?,
            None => self
                .client
                .get(locator.as_str())
                .send()
                .map_err(|err| FetchError::Http(err.to_string()))?,
        };
        let response = Self::handle_status(locator, response)?;
        Ok(RemotePayload::new(response.content_length(), response))
    }
}
