//! HTTP-shaped SSDP datagram payloads.
//!
//! A received message is parsed once and immutable afterwards: headers,
//! UUID/type derived from USN, NTS, LOCATION, max-age with its expiry
//! timestamp, source address, and whether the source lies in the receiving
//! interface's subnet.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime};

use tracing::trace;

use super::{Address, DEFAULT_MAX_AGE};
use crate::errors::UpnpError;
use crate::net::{same_segment, InterfaceBinding};

const M_SEARCH_LINE: &str = "M-SEARCH * HTTP/1.1";
const NOTIFY_LINE: &str = "NOTIFY * HTTP/1.1";

#[derive(Debug, Clone)]
pub struct SsdpMessage {
    start_line: String,
    headers: Vec<(String, String)>,
    source: Option<SocketAddr>,
    interface_address: Option<IpAddr>,
    uuid: String,
    service_type: String,
    nts: Option<String>,
    location: Option<String>,
    max_age: u32,
    received_at: Option<SystemTime>,
    expires_at: Option<SystemTime>,
    valid_segment: bool,
}

impl SsdpMessage {
    /// Parse a received datagram. `binding` is the interface the datagram
    /// arrived on; it feeds the segment-match flag.
    pub fn parse(
        data: &[u8],
        source: SocketAddr,
        binding: &InterfaceBinding,
    ) -> Result<Self, UpnpError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| UpnpError::InvalidMessage("not valid UTF-8".to_string()))?;
        let mut lines = text.lines();
        let start_line = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| UpnpError::InvalidMessage("empty datagram".to_string()))?;

        let upper = start_line.to_ascii_uppercase();
        if !upper.starts_with("NOTIFY ")
            && !upper.starts_with("M-SEARCH ")
            && !upper.starts_with("HTTP/")
        {
            return Err(UpnpError::InvalidMessage(format!(
                "unknown start line: {}",
                start_line
            )));
        }

        let headers = parse_headers(lines);
        let received_at = SystemTime::now();
        let max_age = parse_max_age(header_of(&headers, "CACHE-CONTROL"));
        let (uuid, service_type) = parse_usn(header_of(&headers, "USN"));

        Ok(Self {
            start_line: start_line.to_string(),
            nts: header_of(&headers, "NTS").map(str::to_string),
            location: header_of(&headers, "LOCATION").map(str::to_string),
            headers,
            source: Some(source),
            interface_address: Some(binding.address()),
            uuid,
            service_type,
            max_age,
            received_at: Some(received_at),
            expires_at: Some(received_at + Duration::from_secs(u64::from(max_age))),
            valid_segment: same_segment(source.ip(), binding.address(), binding.prefix_len()),
        })
    }

    /// Build an outgoing M-SEARCH for the given search target.
    pub fn m_search(address: Address, st: &str, mx: u32) -> Self {
        let headers = vec![
            ("HOST".to_string(), address.address_string().to_string()),
            ("MAN".to_string(), "\"ssdp:discover\"".to_string()),
            ("MX".to_string(), mx.max(1).to_string()),
            ("ST".to_string(), st.to_string()),
        ];
        Self {
            start_line: M_SEARCH_LINE.to_string(),
            headers,
            source: None,
            interface_address: None,
            uuid: String::new(),
            service_type: String::new(),
            nts: None,
            location: None,
            max_age: DEFAULT_MAX_AGE,
            received_at: None,
            expires_at: None,
            valid_segment: false,
        }
    }

    pub fn is_notify(&self) -> bool {
        self.start_line.eq_ignore_ascii_case(NOTIFY_LINE)
            || self
                .start_line
                .to_ascii_uppercase()
                .starts_with("NOTIFY ")
    }

    pub fn is_m_search(&self) -> bool {
        self.start_line.to_ascii_uppercase().starts_with("M-SEARCH ")
    }

    /// True for an `HTTP/1.1 200 OK` search response.
    pub fn is_search_response(&self) -> bool {
        let upper = self.start_line.to_ascii_uppercase();
        upper.starts_with("HTTP/") && upper.contains(" 200")
    }

    pub fn start_line(&self) -> &str {
        &self.start_line
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_of(&self.headers, name)
    }

    /// `uuid:...` prefix of USN, empty when USN is absent or malformed.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Device or service type following `::` in USN, empty when absent.
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn nts(&self) -> Option<&str> {
        self.nts.as_deref()
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn max_age(&self) -> u32 {
        self.max_age
    }

    pub fn received_at(&self) -> Option<SystemTime> {
        self.received_at
    }

    /// Wall-clock instant at which this announcement lapses.
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    pub fn source(&self) -> Option<SocketAddr> {
        self.source
    }

    pub fn interface_address(&self) -> Option<IpAddr> {
        self.interface_address
    }

    /// True iff the source address lies within the receiving interface's
    /// subnet. Used upstream to discard packets bridged from other segments.
    pub fn is_valid_segment(&self) -> bool {
        self.valid_segment
    }

    /// Serialize with canonical CRLF line endings and no body.
    pub fn write_data(&self) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        out.push_str(&self.start_line);
        out.push_str("\r\n");
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

impl std::fmt::Display for SsdpMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.write_data()))
    }
}

fn header_of<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        // Empty line marks end of headers; SSDP frames carry no body.
        if line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.is_empty() {
                trace!("Skipping malformed header: '{}'", line);
                continue;
            }
            headers.push((name.to_string(), value.trim().to_string()));
        } else {
            trace!("Skipping line without colon: '{}'", line);
        }
    }
    headers
}

/// `max-age=<int>` from CACHE-CONTROL, case-insensitive. Absent or
/// unparseable values fall back to [`DEFAULT_MAX_AGE`].
fn parse_max_age(value: Option<&str>) -> u32 {
    let Some(value) = value else {
        return DEFAULT_MAX_AGE;
    };
    let lower = value.to_ascii_lowercase();
    let Some(idx) = lower.find("max-age") else {
        return DEFAULT_MAX_AGE;
    };
    let after_key = &lower[idx + "max-age".len()..];
    let after_eq = after_key.trim_start().trim_start_matches('=').trim_start();
    let digits: String = after_eq
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(DEFAULT_MAX_AGE)
}

/// Split USN into (uuid, type) at the `::` separator. A USN not starting
/// with `uuid` yields two empty strings.
fn parse_usn(value: Option<&str>) -> (String, String) {
    let Some(usn) = value else {
        return (String::new(), String::new());
    };
    if !usn.starts_with("uuid") {
        return (String::new(), String::new());
    }
    match usn.split_once("::") {
        Some((uuid, service_type)) => (uuid.to_string(), service_type.to_string()),
        None => (usn.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const ALIVE_FRAME: &str = "NOTIFY * HTTP/1.1\r\n\
        HOST: 239.255.255.250:1900\r\n\
        CACHE-CONTROL: max-age=300\r\n\
        LOCATION: http://192.0.2.2:8080/desc.xml\r\n\
        NT: urn:schemas-upnp-org:service:ContentDirectory:1\r\n\
        NTS: ssdp:alive\r\n\
        SERVER: Linux/3.x UPnP/1.0 Test/1.0\r\n\
        USN: uuid:01234567-89ab-cdef-0123-456789abcdef::urn:schemas-upnp-org:service:ContentDirectory:1\r\n\
        \r\n";

    fn binding() -> InterfaceBinding {
        InterfaceBinding::for_test(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)), 24)
    }

    fn source() -> SocketAddr {
        "192.0.2.2:1900".parse().unwrap()
    }

    #[test]
    fn test_parse_alive_frame() {
        let msg = SsdpMessage::parse(ALIVE_FRAME.as_bytes(), source(), &binding()).unwrap();
        assert!(msg.is_notify());
        assert_eq!(msg.nts(), Some("ssdp:alive"));
        assert_eq!(msg.location(), Some("http://192.0.2.2:8080/desc.xml"));
        assert_eq!(msg.uuid(), "uuid:01234567-89ab-cdef-0123-456789abcdef");
        assert_eq!(
            msg.service_type(),
            "urn:schemas-upnp-org:service:ContentDirectory:1"
        );
        assert_eq!(msg.max_age(), 300);
        assert_eq!(msg.source(), Some(source()));
        assert!(msg.is_valid_segment());
        // Case-insensitive header access.
        assert_eq!(msg.header("nts"), Some("ssdp:alive"));
    }

    #[test]
    fn test_expiry_is_receive_time_plus_max_age() {
        let msg = SsdpMessage::parse(ALIVE_FRAME.as_bytes(), source(), &binding()).unwrap();
        let delta = msg
            .expires_at()
            .unwrap()
            .duration_since(msg.received_at().unwrap())
            .unwrap();
        assert_eq!(delta, Duration::from_secs(300));
    }

    #[test]
    fn test_max_age_defaults() {
        assert_eq!(parse_max_age(None), 1800);
        assert_eq!(parse_max_age(Some("no-cache")), 1800);
        assert_eq!(parse_max_age(Some("max-age=")), 1800);
        assert_eq!(parse_max_age(Some("max-age=abc")), 1800);
        assert_eq!(parse_max_age(Some("MAX-AGE=120")), 120);
        assert_eq!(parse_max_age(Some("public, max-age = 90")), 90);
    }

    #[test]
    fn test_usn_variants() {
        assert_eq!(
            parse_usn(Some("uuid:1234::urn:type:1")),
            ("uuid:1234".to_string(), "urn:type:1".to_string())
        );
        assert_eq!(
            parse_usn(Some("uuid:1234")),
            ("uuid:1234".to_string(), String::new())
        );
        assert_eq!(
            parse_usn(Some("urn:type:1")),
            (String::new(), String::new())
        );
        assert_eq!(parse_usn(None), (String::new(), String::new()));
    }

    #[test]
    fn test_segment_mismatch_flagged() {
        let far_source: SocketAddr = "198.51.100.1:1900".parse().unwrap();
        let msg = SsdpMessage::parse(ALIVE_FRAME.as_bytes(), far_source, &binding()).unwrap();
        assert!(!msg.is_valid_segment());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(SsdpMessage::parse(b"", source(), &binding()).is_err());
        assert!(SsdpMessage::parse(b"GET / HTTP/1.1\r\n\r\n", source(), &binding()).is_err());
        assert!(SsdpMessage::parse(&[0xff, 0xfe, 0x00], source(), &binding()).is_err());
    }

    #[test]
    fn test_m_search_serialization() {
        let msg = SsdpMessage::m_search(Address::IpV4, "ssdp:all", 3);
        let expected = "M-SEARCH * HTTP/1.1\r\n\
             HOST: 239.255.255.250:1900\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: 3\r\n\
             ST: ssdp:all\r\n\
             \r\n";
        assert_eq!(msg.write_data(), expected.as_bytes());
    }

    #[test]
    fn test_m_search_clamps_mx() {
        let msg = SsdpMessage::m_search(Address::IpV4, "upnp:rootdevice", 0);
        assert_eq!(msg.header("MX"), Some("1"));
    }
}
