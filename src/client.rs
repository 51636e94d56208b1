use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{ACCEPT, CONTENT_TYPE, COOKIE, SET_COOKIE};
use hyper::{Body, Client as HyperClient, Method, Request, Response, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::{self, Url};
use validator::ValidationErrors;

use std::fmt;

use crate::user::{ProviderUid, Role};

const JSON: &str = "application/json";

/// Failure categories callers react to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request failed or the server refused it. Roll back and tell the user.
    Network,
    /// A form constraint was violated. Block submission.
    Validation,
    /// The identity token or session is no longer valid. Sign in again.
    Auth,
    /// Signed in with the identity provider but not registered here.
    ProfileNotFound,
    /// The server sent a payload we could not understand.
    Parse,
    /// Local configuration or storage problem.
    Local,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP transport error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("invalid HTTP request: {0}")]
    Http(#[from] hyper::http::Error),
    #[error("malformed payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("API URL must use https")]
    InvalidUrl,
    #[error("server responded {status}: {message}")]
    Response { status: u16, message: String },
    #[error("{0}")]
    Validation(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("account is not registered")]
    ProfileNotFound,
    #[error("login response carried no session cookie")]
    MissingSessionCookie,
    #[error("header value is not valid text")]
    InvalidHeader,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cached value for {0} has an unexpected shape")]
    CacheShape(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Hyper(_) | Error::Http(_) | Error::Response { .. } => ErrorKind::Network,
            Error::MissingSessionCookie | Error::InvalidHeader => ErrorKind::Network,
            Error::Parse(_) => ErrorKind::Parse,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Auth(_) => ErrorKind::Auth,
            Error::ProfileNotFound => ErrorKind::ProfileNotFound,
            Error::Url(_) | Error::InvalidUrl | Error::Io(_) | Error::Config(_) => ErrorKind::Local,
            Error::CacheShape(_) => ErrorKind::Local,
        }
    }

    /// HTTP status of a server rejection, if that is what this is.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Response { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// First message in `errors`, looking at fields in form `order` before
    /// any others.
    pub(crate) fn from_validation(errors: &ValidationErrors, order: &[&str]) -> Self {
        let fields = errors.field_errors();
        let message = order
            .iter()
            .filter_map(|field| fields.get(*field))
            .chain(fields.values())
            .flat_map(|list| list.iter())
            .map(|error| match error.message {
                Some(ref message) => message.to_string(),
                None => error.code.to_string(),
            })
            .next()
            .unwrap_or_else(|| "Invalid input".to_string());
        Error::Validation(message)
    }

    fn from_response(status: StatusCode, body: &[u8]) -> Self {
        let message = serde_json::from_slice::<ErrorBody>(body)
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth(message),
            _ => Error::Response {
                status: status.as_u16(),
                message,
            },
        }
    }
}

impl From<ValidationErrors> for Error {
    fn from(errors: ValidationErrors) -> Self {
        Error::from_validation(&errors, &[])
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Serialize)]
struct Login<'a> {
    #[serde(rename = "idToken")]
    id_token: &'a str,
}

/// What the backend says about the account behind a fresh login.
#[derive(Deserialize, Debug, Default)]
pub struct LoginResponse {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub user: Option<crate::user::Profile>,
}

/// Any request body, extended with the viewer's provider uid.
#[derive(Serialize)]
pub(crate) struct ViewerBody<'a, B: Serialize> {
    pub firebase_uid: &'a str,
    #[serde(flatten)]
    pub body: B,
}

/// Request body for endpoints that only need the viewer uid.
#[derive(Serialize)]
pub(crate) struct NoFields {}

/// Session credential as sent back in the `Cookie` header.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: &str) -> Self {
        SessionToken(token.to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Take the `name=value` pair from a `Set-Cookie` header value.
    fn from_set_cookie(header: &str) -> Option<Self> {
        let pair = header.split(';').next()?.trim();
        if pair.is_empty() || !pair.contains('=') {
            None
        } else {
            Some(SessionToken(pair.to_string()))
        }
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SessionToken(..)")
    }
}

struct HttpClient {
    base_url: Url,
    hyper: HyperClient<HttpsConnector<HttpConnector>, Body>,
}

impl HttpClient {
    fn new(url: Url, allow_insecure: bool) -> Result<Self> {
        if url.scheme() != "https" && !(allow_insecure && url.scheme() == "http") {
            return Err(Error::InvalidUrl);
        }

        // Relative joins need the base to end in a slash
        let mut base_url = url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let builder = HttpsConnectorBuilder::new().with_webpki_roots();
        let https = if allow_insecure {
            builder.https_or_http().enable_http1().build()
        } else {
            builder.https_only().enable_http1().build()
        };
        let hyper: HyperClient<_, Body> = HyperClient::builder().build(https);

        Ok(HttpClient { base_url, hyper })
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.base_url.join(path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<(Body, &str)>,
        session: Option<&SessionToken>,
    ) -> Result<Response<Body>> {
        debug!("{} {}", method, url.as_str());
        let mut request = Request::builder()
            .method(method)
            .uri(url.as_str())
            .header(ACCEPT, JSON);
        if let Some(token) = session {
            request = request.header(COOKIE, token.as_str());
        }
        let request = match body {
            Some((body, content_type)) => request.header(CONTENT_TYPE, content_type).body(body)?,
            None => request.body(Body::empty())?,
        };

        let response = self.hyper.request(request).await?;
        debug!(status = %response.status(), "response");
        Ok(response)
    }

    async fn send_json<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        session: Option<&SessionToken>,
    ) -> Result<Response<Body>> {
        let url = self.url(path, &[])?;
        let body = Body::from(serde_json::to_vec(body)?);
        self.send(method, url, Some((body, JSON)), session).await
    }
}

async fn read_body(response: Response<Body>) -> Result<Bytes> {
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await?;
    if !status.is_success() {
        return Err(Error::from_response(status, &bytes));
    }
    Ok(bytes)
}

async fn read_json<T: DeserializeOwned>(response: Response<Body>) -> Result<T> {
    let bytes = read_body(response).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub struct UnauthenticatedClient {
    http: HttpClient,
}

pub struct Client {
    http: HttpClient,
    session_token: SessionToken,
    viewer: ProviderUid,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "WestWindClient({})", self.viewer.as_str())
    }
}

impl fmt::Debug for UnauthenticatedClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UnauthenticatedClient({})", self.http.base_url)
    }
}

impl UnauthenticatedClient {
    /// Client for an https API root such as `https://westwind.example/api`.
    pub fn new(url: Url) -> Result<Self> {
        Ok(UnauthenticatedClient {
            http: HttpClient::new(url, false)?,
        })
    }

    /// Also accepts plain `http` roots, for local development.
    pub fn new_insecure(url: Url) -> Result<Self> {
        Ok(UnauthenticatedClient {
            http: HttpClient::new(url, true)?,
        })
    }

    /// Exchange an identity token for a session cookie.
    pub async fn login(&self, id_token: &str) -> Result<(SessionToken, LoginResponse)> {
        let body = Login { id_token };
        let response = self
            .http
            .send_json(Method::POST, "auth/login", &body, None)
            .await?;

        let token = match response.headers().get(SET_COOKIE) {
            Some(value) => {
                let value = value.to_str().map_err(|_| Error::InvalidHeader)?;
                SessionToken::from_set_cookie(value)
            }
            None => None,
        };

        let bytes = read_body(response).await?;
        let token = token.ok_or(Error::MissingSessionCookie)?;
        let login = if bytes.is_empty() {
            LoginResponse::default()
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((token, login))
    }

    /// Create or refresh the backend user for a signed-in account.
    pub async fn register<B: Serialize>(
        &self,
        session: Option<&SessionToken>,
        body: &B,
    ) -> Result<LoginResponse> {
        let response = self
            .http
            .send_json(Method::POST, "users", body, session)
            .await?;
        read_json(response).await
    }

    /// Consume the unauthenticated client, attaching a session.
    pub fn into_client(self, session_token: SessionToken, viewer: ProviderUid) -> Client {
        Client {
            http: self.http,
            session_token,
            viewer,
        }
    }
}

impl Client {
    pub fn viewer(&self) -> &ProviderUid {
        &self.viewer
    }

    pub fn session_token(&self) -> &SessionToken {
        &self.session_token
    }

    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = self.http.url(path, query)?;
        let response = self
            .http
            .send(Method::GET, url, None, Some(&self.session_token))
            .await?;
        read_json(response).await
    }

    /// Send `body` extended with the viewer uid and decode the reply.
    pub(crate) async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: B,
    ) -> Result<T> {
        let body = ViewerBody {
            firebase_uid: self.viewer.as_str(),
            body,
        };
        let response = self
            .http
            .send_json(method, path, &body, Some(&self.session_token))
            .await?;
        read_json(response).await
    }

    /// Like [`call`](Self::call) for endpoints whose reply we ignore.
    pub(crate) async fn call_empty<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: B,
    ) -> Result<()> {
        let body = ViewerBody {
            firebase_uid: self.viewer.as_str(),
            body,
        };
        let response = self
            .http
            .send_json(method, path, &body, Some(&self.session_token))
            .await?;
        read_body(response).await.map(|_| ())
    }

    pub(crate) async fn upload(&self, content_type: &str, bytes: Vec<u8>) -> Result<Url> {
        #[derive(Deserialize)]
        struct Uploaded {
            url: Url,
        }

        let url = self.http.url("upload", &[])?;
        let response = self
            .http
            .send(
                Method::POST,
                url,
                Some((Body::from(bytes), content_type)),
                Some(&self.session_token),
            )
            .await?;
        let uploaded: Uploaded = read_json(response).await?;
        Ok(uploaded.url)
    }

    /// End the server session and hand back an unauthenticated client.
    pub async fn logout(self) -> Result<UnauthenticatedClient> {
        let url = self.http.url("auth/logout", &[])?;
        let response = self
            .http
            .send(Method::POST, url, None, Some(&self.session_token))
            .await?;
        read_body(response).await?;
        Ok(UnauthenticatedClient { http: self.http })
    }
}
