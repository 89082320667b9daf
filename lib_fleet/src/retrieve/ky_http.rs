//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest` with exponential
//! backoff retries, shared by every call the monitor makes to its backends.
//!
//! Each request carries the session credential in `X-Access-Token` and the
//! sender identity (query string for GET, JSON body for POST and PUT).

use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::core::session::SessionContext;

/// Header carrying the session credential.
pub const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";

/// Paths reachable without a credential.
const UNGUARDED_PATHS: [&str; 2] = ["/login/login", "/login/findId"];

#[derive(Debug, Error)]
pub enum RequestError {
    /// Raised before any I/O when a guarded path is called without a credential.
    #[error("please login: {0} requires a credential")]
    Unauthorized(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest_middleware::Error),

    #[error("response handling failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("body encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Non-2xx answer. `body` is the server's error body.
    #[error("server answered {status}: {body}")]
    Server { status: u16, body: Value },
}

/// The backend a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTarget {
    /// Cloud API.
    Apis,
    /// Edge gateway.
    Edge,
    /// Monitoring backend.
    Baro,
}

/// Base URLs of the three backends.
#[derive(Debug, Clone)]
pub struct ServerTargets {
    apis: Url,
    edge: Url,
    baro: Url,
}

impl ServerTargets {
    pub fn new(apis: &str, edge: &str, baro: &str) -> Result<Self, RequestError> {
        Ok(Self {
            apis: Url::parse(apis)?,
            edge: Url::parse(edge)?,
            baro: Url::parse(baro)?,
        })
    }

    pub fn base(&self, target: ServerTarget) -> &Url {
        match target {
            ServerTarget::Apis => &self.apis,
            ServerTarget::Edge => &self.edge,
            ServerTarget::Baro => &self.baro,
        }
    }

    /// Appends `path` to the target's base, keeping any base path prefix.
    pub fn resolve(&self, target: ServerTarget, path: &str) -> Result<Url, RequestError> {
        let base = self.base(target).as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Ok(Url::parse(&format!("{}/{}", base, path))?)
    }
}

/// A successful answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub data: T,
    pub status: u16,
}

/// # API Client
///
/// Holds the retrying HTTP client, the backend URLs and the session context.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    targets: ServerTargets,
    context: SessionContext,
}

impl ApiClient {
    /// Creates a client with an exponential backoff policy of 3 retries.
    pub fn new(targets: ServerTargets, context: SessionContext) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            inner: client,
            targets,
            context,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub async fn get<T: DeserializeOwned>(&self, target: ServerTarget, path: &str) -> Result<ApiResponse<T>, RequestError> {
        self.request::<T, Value>(Method::GET, target, path, None).await
    }

    pub async fn post<T, B>(&self, target: ServerTarget, path: &str, body: Option<B>) -> Result<ApiResponse<T>, RequestError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        self.request(Method::POST, target, path, body).await
    }

    pub async fn put<T, B>(&self, target: ServerTarget, path: &str, body: Option<B>) -> Result<ApiResponse<T>, RequestError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        self.request(Method::PUT, target, path, body).await
    }

    pub async fn patch<T, B>(&self, target: ServerTarget, path: &str, body: Option<B>) -> Result<ApiResponse<T>, RequestError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        self.request(Method::PATCH, target, path, body).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, target: ServerTarget, path: &str) -> Result<ApiResponse<T>, RequestError> {
        self.request::<T, Value>(Method::DELETE, target, path, None).await
    }

    /// # Request
    ///
    /// ## Logic:
    /// 1.  Refuses guarded paths when the context has no credential.
    /// 2.  Resolves the URL against the target's base.
    /// 3.  Attaches the credential header and the sender (query for GET,
    ///     merged into the JSON object body for POST and PUT).
    /// 4.  Sends through the retry middleware.
    /// 5.  2xx bodies are deserialized into `T`; anything else becomes
    ///     `RequestError::Server` carrying the error body.
    pub async fn request<T, B>(
        &self,
        method: Method,
        target: ServerTarget,
        path: &str,
        body: Option<B>,
    ) -> Result<ApiResponse<T>, RequestError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        if self.context.credential.is_none() && !UNGUARDED_PATHS.contains(&path) {
            return Err(RequestError::Unauthorized(path.to_string()));
        }

        let mut url = self.targets.resolve(target, path)?;
        let sender = self.context.sender.as_deref();

        let mut body = body.map(|b| serde_json::to_value(&b)).transpose()?;
        if method == Method::GET {
            if let Some(sender) = sender {
                url.query_pairs_mut().append_pair("sender", sender);
            }
        } else if method == Method::POST || method == Method::PUT {
            body = Some(with_sender(body, sender));
        }

        let mut req = self
            .inner
            .request(method.clone(), url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCESS_TOKEN_HEADER, self.context.credential.clone().unwrap_or_default());
        if let Some(body) = body {
            req = req.body(serde_json::to_string(&body)?);
        }

        let response = req.send().await?;
        let status = response.status();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data,
                status: status.as_u16(),
            })
        } else {
            let text = response.text().await.unwrap_or_default();
            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
            log::debug!("{} {} failed with {}: {}", method, path, status, body);
            Err(RequestError::Server {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Merges `sender` into an object body. Non-object bodies are sent as-is.
fn with_sender(body: Option<Value>, sender: Option<&str>) -> Value {
    let mut body = body.unwrap_or_else(|| Value::Object(Default::default()));
    if let (Value::Object(map), Some(sender)) = (&mut body, sender) {
        map.insert("sender".to_string(), Value::String(sender.to_string()));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serves one canned response and hands back the raw request it received.
    fn serve_once(status_line: &str, body: &str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{}", port);
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    if received.len() >= split + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
            String::from_utf8_lossy(&received).to_string()
        });

        (url, handle)
    }

    fn client(base: &str, credential: Option<&str>) -> ApiClient {
        ApiClient::new(
            ServerTargets::new(base, base, base).unwrap(),
            SessionContext::new(credential.map(str::to_string), Some("board-1".to_string())),
        )
    }

    #[test]
    fn resolve_keeps_base_path() {
        let targets = ServerTargets::new("http://a/api/", "http://b", "http://c/baro").unwrap();
        assert_eq!(
            targets.resolve(ServerTarget::Baro, "/machine/currentList").unwrap().as_str(),
            "http://c/baro/machine/currentList"
        );
        assert_eq!(targets.resolve(ServerTarget::Apis, "x").unwrap().as_str(), "http://a/api/x");
    }

    #[test]
    fn sender_is_merged_into_object_bodies() {
        assert_eq!(with_sender(None, Some("s")), json!({ "sender": "s" }));
        assert_eq!(
            with_sender(Some(json!({ "transmitter": "t" })), Some("s")),
            json!({ "transmitter": "t", "sender": "s" })
        );
        assert_eq!(with_sender(Some(json!([1])), Some("s")), json!([1]));
    }

    #[tokio::test]
    async fn guarded_path_without_credential_fails_before_io() {
        // Nothing listens here; an attempted request would be a transport error.
        let api = client("http://127.0.0.1:9", None);
        let err = api.get::<Value>(ServerTarget::Baro, "/machine/currentList").await.unwrap_err();
        assert!(matches!(err, RequestError::Unauthorized(ref p) if p == "/machine/currentList"));
    }

    #[tokio::test]
    async fn login_path_is_reachable_without_credential() {
        let (url, server) = serve_once("200 OK", r#"{"ok":true}"#);
        let api = client(&url, None);

        let response = api
            .post::<Value, Value>(ServerTarget::Apis, "/login/login", Some(json!({ "id": "op" })))
            .await
            .unwrap();
        let request = server.join().unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.data, json!({ "ok": true }));
        assert!(request.starts_with("POST /login/login"));
        assert!(request.contains(r#""sender":"board-1""#));
    }

    #[tokio::test]
    async fn get_sends_token_header_and_sender_query() {
        let (url, server) = serve_once("200 OK", r#"[{"prdct_end":"2024-05-01 12:00:00"}]"#);
        let api = client(&url, Some("tok"));

        let response = api.get::<Value>(ServerTarget::Baro, "/mon/prd_end/5").await.unwrap();
        let request = server.join().unwrap();

        assert!(request.starts_with("GET /mon/prd_end/5?sender=board-1 "));
        assert!(request.to_ascii_lowercase().contains("x-access-token: tok"));
        assert_eq!(response.data[0]["prdct_end"], "2024-05-01 12:00:00");
    }

    #[tokio::test]
    async fn error_body_is_the_failure_value() {
        let (url, server) = serve_once("400 Bad Request", r#"{"message":"bad transmitter"}"#);
        let api = client(&url, Some("tok"));

        let err = api
            .post::<Value, Value>(ServerTarget::Edge, "/api/edge/edge_machine_stat", None)
            .await
            .unwrap_err();
        server.join().unwrap();

        match err {
            RequestError::Server { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, json!({ "message": "bad transmitter" }));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
