//! HTTP listener for GENA NOTIFY callbacks.
//!
//! Binds an ephemeral TCP port (the control point's event port), accepts
//! NOTIFY requests, parses the `<e:propertyset>` payload, and hands the
//! result to the installed handler. The handler answers whether the SID is
//! known; unknown subscriptions get 412 so well-behaved devices stop
//! notifying them.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Cursor, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{trace, warn};
use xmltree::{Element, XMLNode};

use crate::task::TaskExecutors;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One NOTIFY callback: the lease it belongs to, its event sequence number,
/// and the evented state variables.
#[derive(Debug, Clone)]
pub struct EventNotification {
    pub sid: String,
    pub seq: u64,
    pub properties: Vec<(String, String)>,
}

/// Returns true when the SID belongs to a live subscription.
pub type NotifyHandler = Arc<dyn Fn(EventNotification) -> bool + Send + Sync>;

pub struct EventReceiver {
    port: u16,
    shutdown: Arc<AtomicBool>,
}

impl EventReceiver {
    pub fn spawn(
        executors: &TaskExecutors,
        handler: impl Fn(EventNotification) -> bool + Send + Sync + 'static,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let port = listener.local_addr()?.port();
        // Non-blocking accept so the loop can observe shutdown.
        listener.set_nonblocking(true)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handler: NotifyHandler = Arc::new(handler);
        if !executors.server("-event-receiver", move || {
            run_listener(listener, flag, handler)
        }) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "task executors are terminated",
            ));
        }
        Ok(Self { port, shutdown })
    }

    /// The port to advertise in CALLBACK headers.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn terminate(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_listener(listener: TcpListener, shutdown: Arc<AtomicBool>, handler: NotifyHandler) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = serve_connection(stream, &handler) {
                    trace!("Notify connection from {} failed: {}", peer, err);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                warn!("Incoming notify connection failed: {}", err);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn serve_connection(mut stream: TcpStream, handler: &NotifyHandler) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let request = match read_http_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            let _ = write_http_response(&mut stream, 400, "Bad Request");
            return Err(err);
        }
    };

    if request.method != "NOTIFY" {
        return write_http_response(&mut stream, 405, "Method Not Allowed");
    }
    let (Some(sid), Some(nt), Some(nts)) = (
        request.headers.get("sid"),
        request.headers.get("nt"),
        request.headers.get("nts"),
    ) else {
        return write_http_response(&mut stream, 412, "Precondition Failed");
    };
    if !nt.eq_ignore_ascii_case("upnp:event") || !nts.eq_ignore_ascii_case("upnp:propchange") {
        return write_http_response(&mut stream, 412, "Precondition Failed");
    }

    let notification = EventNotification {
        sid: sid.clone(),
        seq: request
            .headers
            .get("seq")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        properties: parse_property_set(&request.body),
    };

    if handler(notification) {
        write_http_response(&mut stream, 200, "OK")
    } else {
        write_http_response(&mut stream, 412, "Precondition Failed")
    }
}

struct HttpRequest {
    method: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

fn read_http_request(stream: &mut TcpStream) -> io::Result<HttpRequest> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "missing request line",
        ));
    }
    let method = request_line
        .split_whitespace()
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing method"))?
        .to_ascii_uppercase();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;

    Ok(HttpRequest {
        method,
        headers,
        body,
    })
}

fn write_http_response(stream: &mut TcpStream, status: u16, message: &str) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, message
    );
    stream.write_all(response.as_bytes())
}

/// Flatten `<e:propertyset><e:property><Var>value</Var>...` into
/// `(variable, value)` pairs. A malformed payload yields no properties.
fn parse_property_set(body: &[u8]) -> Vec<(String, String)> {
    let Ok(root) = Element::parse(Cursor::new(body)) else {
        trace!("Failed to parse notify property set");
        return Vec::new();
    };
    let mut properties = Vec::new();
    for property in xml_children(&root) {
        for variable in xml_children(property) {
            let value = variable
                .get_text()
                .map(|text| text.into_owned())
                .unwrap_or_default();
            properties.push((variable.name.clone(), value));
        }
    }
    properties
}

fn xml_children(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| match node {
        XMLNode::Element(element) => Some(element),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const PROPERTY_SET: &str = "<?xml version=\"1.0\"?>\
        <e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\">\
        <e:property><SystemUpdateID>123</SystemUpdateID></e:property>\
        <e:property><ContainerUpdateIDs>1,7</ContainerUpdateIDs></e:property>\
        </e:propertyset>";

    fn send_request(port: u16, request: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(request.as_bytes()).unwrap();
        let mut response = String::new();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    fn notify_request(sid: &str, body: &str) -> String {
        format!(
            "NOTIFY /event HTTP/1.1\r\n\
             HOST: 127.0.0.1\r\n\
             CONTENT-TYPE: text/xml\r\n\
             NT: upnp:event\r\n\
             NTS: upnp:propchange\r\n\
             SID: {}\r\n\
             SEQ: 4\r\n\
             CONTENT-LENGTH: {}\r\n\
             \r\n{}",
            sid,
            body.len(),
            body
        )
    }

    #[test]
    fn test_notify_is_parsed_and_acknowledged() {
        let executors = TaskExecutors::new();
        let seen: Arc<Mutex<Vec<EventNotification>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let receiver = EventReceiver::spawn(&executors, move |notification| {
            let known = notification.sid == "uuid:sub-1";
            sink.lock().unwrap().push(notification);
            known
        })
        .unwrap();

        let response = send_request(
            receiver.local_port(),
            &notify_request("uuid:sub-1", PROPERTY_SET),
        );
        assert!(response.starts_with("HTTP/1.1 200"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].sid, "uuid:sub-1");
        assert_eq!(seen[0].seq, 4);
        assert_eq!(
            seen[0].properties,
            vec![
                ("SystemUpdateID".to_string(), "123".to_string()),
                ("ContainerUpdateIDs".to_string(), "1,7".to_string()),
            ]
        );
    }

    #[test]
    fn test_unknown_sid_is_rejected() {
        let executors = TaskExecutors::new();
        let receiver = EventReceiver::spawn(&executors, |_| false).unwrap();
        let response = send_request(
            receiver.local_port(),
            &notify_request("uuid:stranger", PROPERTY_SET),
        );
        assert!(response.starts_with("HTTP/1.1 412"));
    }

    #[test]
    fn test_non_notify_method_is_rejected() {
        let executors = TaskExecutors::new();
        let receiver = EventReceiver::spawn(&executors, |_| true).unwrap();
        let response = send_request(
            receiver.local_port(),
            "GET /event HTTP/1.1\r\nHOST: 127.0.0.1\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 405"));
    }

    #[test]
    fn test_missing_gena_headers_rejected() {
        let executors = TaskExecutors::new();
        let receiver = EventReceiver::spawn(&executors, |_| true).unwrap();
        let response = send_request(
            receiver.local_port(),
            "NOTIFY /event HTTP/1.1\r\nHOST: 127.0.0.1\r\nCONTENT-LENGTH: 0\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 412"));
    }
}
