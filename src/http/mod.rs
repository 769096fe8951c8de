//! Minimal blocking HTTP surface consumed by the GENA layer: a request with
//! method / absolute URL / headers, a response with status and headers. The
//! trait keeps the subscription manager testable without a device on the
//! network.

use std::collections::HashMap;
use std::io::{self, Read};
use std::time::Duration;

use ureq::{http, Agent};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: String,
    url: String,
    headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Synchronous request/response transport.
pub trait HttpClient: Send + Sync {
    fn post(&self, request: &HttpRequest) -> io::Result<HttpResponse>;
}

/// The production transport. SUBSCRIBE/UNSUBSCRIBE are not standard HTTP
/// methods, and GENA error statuses must reach the caller as responses, not
/// transport errors.
pub struct UreqClient {
    agent: Agent,
}

impl UreqClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .allow_non_standard_methods(true)
            .build();
        Self {
            agent: agent.into(),
        }
    }
}

impl Default for UreqClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for UreqClient {
    fn post(&self, request: &HttpRequest) -> io::Result<HttpResponse> {
        let mut builder = http::Request::builder()
            .method(request.method())
            .uri(request.url());
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }
        let wire_request = builder
            .body(())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        let response = self
            .agent
            .run(wire_request)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        let (parts, body) = response.into_parts();
        let mut headers = HashMap::new();
        for (name, value) in parts.headers.iter() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        let mut bytes = Vec::new();
        body.into_reader().read_to_end(&mut bytes)?;
        Ok(HttpResponse {
            status: parts.status.as_u16(),
            headers,
            body: bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_keeps_header_order() {
        let request = HttpRequest::new("SUBSCRIBE", "http://192.0.2.2/event")
            .header("NT", "upnp:event")
            .header("TIMEOUT", "Second-300");
        assert_eq!(request.method(), "SUBSCRIBE");
        assert_eq!(
            request.headers(),
            &[
                ("NT".to_string(), "upnp:event".to_string()),
                ("TIMEOUT".to_string(), "Second-300".to_string()),
            ]
        );
    }

    #[test]
    fn test_response_header_lookup_is_case_insensitive() {
        let response = HttpResponse::new(200).with_header("SID", "uuid:sub-1");
        assert_eq!(response.header("sid"), Some("uuid:sub-1"));
        assert_eq!(response.header("Sid"), Some("uuid:sub-1"));
        assert_eq!(response.header("timeout"), None);
    }
}
