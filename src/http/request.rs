//! A single HTTP request, following redirects through the firewall.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use super::address::{self, UrlKind};
use crate::computer::Value;
use crate::firewall::{Firewall, Options};

/// Event fired with the response of a successful request.
pub const HTTP_SUCCESS: &str = "http_success";
/// Event fired when a request fails or returns an error status.
pub const HTTP_FAILURE: &str = "http_failure";

/// Maximum number of redirects followed for one request.
pub const MAX_REDIRECTS: usize = 16;

/// Longest timeout a request may ask for.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60);

const CONNECT_TIMEOUT_SECS: u64 = 10;
const USER_AGENT: &str = concat!("ccore/", env!("CARGO_PKG_VERSION"));

pub const TIMED_OUT: &str = "Timed out";
pub const COULD_NOT_CONNECT: &str = "Could not connect";
pub const RESPONSE_TOO_LARGE: &str = "Response is too large";
pub const BODY_TOO_LARGE: &str = "Request body is too large";

/// A request as submitted by a machine.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    /// Defaults to `GET`, or `POST` when a body is present.
    pub method: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Whether redirects are followed.
    pub redirect: bool,
    /// Overrides the address rule's timeout. Zero means no timeout.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: None,
            headers: Vec::new(),
            body: None,
            redirect: true,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::get(url)
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn method(&self) -> Result<Method, String> {
        match &self.method {
            Some(method) => Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|_| format!("Unsupported HTTP method '{}'", method)),
            None if self.body.is_some() => Ok(Method::POST),
            None => Ok(Method::GET),
        }
    }

    pub(crate) fn header_map(&self) -> Result<HeaderMap, String> {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("Invalid header name '{}'", name))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| format!("Invalid value for header '{}'", name))?;
            map.append(name, value);
        }
        Ok(map)
    }
}

/// A request that failed, with the response if one was received.
#[derive(Debug)]
pub(crate) struct Failure {
    pub message: String,
    pub response: Option<Value>,
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self {
            message,
            response: None,
        }
    }
}

impl From<&str> for Failure {
    fn from(message: &str) -> Self {
        Self::from(message.to_string())
    }
}

/// Everything needed to run a request, validated up front.
pub(crate) struct PreparedRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    pub redirect: bool,
    pub timeout: Option<Duration>,
}

impl PreparedRequest {
    pub fn new(request: HttpRequest) -> Result<Self, String> {
        let url = address::check_uri(&request.url, UrlKind::Http)?;
        let method = request.method()?;
        let headers = request.header_map()?;
        if let Some(timeout) = request.timeout {
            if timeout > MAX_TIMEOUT {
                return Err(format!("timeout out of range ({}s)", timeout.as_secs_f64()));
            }
        }
        Ok(Self {
            url,
            method,
            headers,
            body: request.body,
            redirect: request.redirect,
            timeout: request.timeout,
        })
    }

    /// The timeout for a hop, given the options of the address it goes to.
    fn timeout_for(&self, options: &Options) -> Option<Duration> {
        match self.timeout {
            Some(timeout) if timeout.is_zero() => None,
            Some(timeout) => Some(timeout),
            None => options.timeout,
        }
    }
}

/// Perform the request, returning the response table.
///
/// Every hop is resolved and checked against the firewall, and the
/// connection goes to the address that was approved.
pub(crate) async fn execute(
    firewall: &Firewall,
    request: PreparedRequest,
) -> Result<Value, Failure> {
    let mut url = request.url.clone();
    let mut method = request.method.clone();
    let mut body = request.body.clone();
    let headers = &request.headers;
    let mut redirects_left = if request.redirect { MAX_REDIRECTS } else { 0 };

    loop {
        let target = address::resolve(firewall, &url).await?;
        let options = &target.options;

        let upload = body.as_ref().map_or(0, Vec::len) as u64 + header_size(headers);
        if options.max_upload != 0 && upload > options.max_upload {
            return Err(BODY_TOO_LARGE.into());
        }

        let client = build_client(&target.host, target.address, request.timeout_for(options))?;
        let mut builder = client
            .request(method.clone(), url.clone())
            .headers(headers.clone());
        if let Some(body) = &body {
            builder = builder.body(body.clone());
        }

        let mut response = builder.send().await.map_err(friendly_error)?;
        let status = response.status();

        if redirects_left > 0 {
            if let Some(next) = redirect_target(&url, status, response.headers()) {
                redirects_left -= 1;
                debug!(from = %url, to = %next, status = status.as_u16(), "Following redirect");
                address::check_uri(next.as_str(), UrlKind::Http)?;
                if status == StatusCode::SEE_OTHER {
                    method = Method::GET;
                    body = None;
                }
                url = next;
                continue;
            }
        }

        if let Some(length) = response.content_length() {
            if options.max_download != 0 && length > options.max_download {
                return Err(RESPONSE_TOO_LARGE.into());
            }
        }

        let mut data = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(friendly_error)? {
            if options.max_download != 0
                && (data.len() + chunk.len()) as u64 > options.max_download
            {
                return Err(RESPONSE_TOO_LARGE.into());
            }
            data.extend_from_slice(&chunk);
        }

        let table = response_table(&url, status, response.headers(), data);
        return if status.is_success() || status.is_redirection() || status.is_informational() {
            Ok(table)
        } else {
            Err(Failure {
                message: status.canonical_reason().unwrap_or("Unknown").to_string(),
                response: Some(table),
            })
        };
    }
}

fn build_client(
    host: &str,
    address: std::net::SocketAddr,
    timeout: Option<Duration>,
) -> Result<Client, Failure> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(Policy::none())
        .user_agent(USER_AGENT)
        .resolve(host, address);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().map_err(|e| {
        warn!(error = %e, "Failed to build HTTP client");
        Failure::from(COULD_NOT_CONNECT)
    })
}

/// Map a transport error onto a message for the script.
pub(crate) fn friendly_error(error: reqwest::Error) -> Failure {
    debug!(error = %error, "HTTP request failed");
    if error.is_timeout() {
        TIMED_OUT.into()
    } else {
        COULD_NOT_CONNECT.into()
    }
}

fn header_size(headers: &HeaderMap) -> u64 {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().len() + value.len()) as u64)
        .sum()
}

/// The URL a response redirects to, if it is a redirect we follow.
fn redirect_target(current: &Url, status: StatusCode, headers: &HeaderMap) -> Option<Url> {
    let code = status.as_u16();
    if !(300..=307).contains(&code) || code == 304 || code == 306 {
        return None;
    }

    let location = headers.get(LOCATION)?.to_str().ok()?;
    let next = current.join(location).ok()?;
    (next != *current).then_some(next)
}

/// Build the table handed to the machine. Repeated headers are joined with `,`.
fn response_table(url: &Url, status: StatusCode, headers: &HeaderMap, body: Vec<u8>) -> Value {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        merged
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }

    Value::table([
        ("url", Value::from(url.as_str())),
        ("status", Value::from(status.as_u16())),
        (
            "reason",
            Value::from(status.canonical_reason().unwrap_or("")),
        ),
        (
            "headers",
            Value::table(merged.into_iter().map(|(k, v)| (k, Value::String(v)))),
        ),
        ("body", Value::Bytes(body)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::PartialOptions;

    #[test]
    fn test_default_method() {
        assert_eq!(HttpRequest::get("http://a").method().unwrap(), Method::GET);
        assert_eq!(
            HttpRequest::post("http://a", "x").method().unwrap(),
            Method::POST
        );
        assert_eq!(
            HttpRequest::get("http://a")
                .with_method("delete")
                .method()
                .unwrap(),
            Method::DELETE
        );
    }

    #[test]
    fn test_invalid_header_rejected() {
        let request = HttpRequest::get("http://a").with_header("bad header", "x");
        assert!(request.header_map().is_err());
    }

    #[test]
    fn test_request_timeout_overrides_rule() {
        let options = PartialOptions::default().to_options();
        let prepare = |request: HttpRequest| PreparedRequest::new(request).unwrap();

        let plain = prepare(HttpRequest::get("http://a"));
        assert_eq!(plain.timeout_for(&options), options.timeout);

        let short = prepare(HttpRequest::get("http://a").with_timeout(Duration::from_secs(2)));
        assert_eq!(short.timeout_for(&options), Some(Duration::from_secs(2)));

        let unlimited = prepare(HttpRequest::get("http://a").with_timeout(Duration::ZERO));
        assert_eq!(unlimited.timeout_for(&options), None);
    }

    #[test]
    fn test_request_timeout_is_capped() {
        let request = HttpRequest::get("http://a").with_timeout(Duration::from_secs(61));
        assert_eq!(
            PreparedRequest::new(request).err().unwrap(),
            "timeout out of range (61s)"
        );
        let request = HttpRequest::get("http://a").with_timeout(MAX_TIMEOUT);
        assert!(PreparedRequest::new(request).is_ok());
    }

    #[test]
    fn test_prepare_rejects_bad_scheme() {
        let err = PreparedRequest::new(HttpRequest::get("ftp://example.com"))
            .err()
            .unwrap();
        assert_eq!(err, "Invalid protocol 'ftp'");
    }

    #[test]
    fn test_redirect_target() {
        let current = Url::parse("http://example.com/a/b").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("../c"));

        let next = redirect_target(&current, StatusCode::FOUND, &headers).unwrap();
        assert_eq!(next.as_str(), "http://example.com/c");

        assert!(redirect_target(&current, StatusCode::NOT_MODIFIED, &headers).is_none());
        assert!(redirect_target(&current, StatusCode::OK, &headers).is_none());
        assert!(redirect_target(&current, StatusCode::FOUND, &HeaderMap::new()).is_none());

        headers.insert(LOCATION, HeaderValue::from_static("/a/b"));
        assert!(redirect_target(&current, StatusCode::FOUND, &headers).is_none());
    }

    #[test]
    fn test_response_table_merges_headers() {
        let url = Url::parse("http://example.com/").unwrap();
        let mut headers = HeaderMap::new();
        headers.append("x-thing", HeaderValue::from_static("a"));
        headers.append("x-thing", HeaderValue::from_static("b"));

        let table = response_table(&url, StatusCode::OK, &headers, b"hi".to_vec());
        assert_eq!(table.get("status").and_then(Value::as_number), Some(200.0));
        assert_eq!(
            table
                .get("headers")
                .and_then(|h| h.get("x-thing"))
                .and_then(Value::as_str),
            Some("a,b")
        );
        assert_eq!(table.get("body"), Some(&Value::Bytes(b"hi".to_vec())));
    }
}
