//! Port-1900 SSDP role: member of the multicast group, surfaces NOTIFY
//! announcements as typed events.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::trace;

use super::message::SsdpMessage;
use super::server::{Receiver, SsdpServer};
use super::{Address, NTS_ALIVE, NTS_BYEBYE, NTS_UPDATE, SSDP_PORT};
use crate::errors::UpnpError;
use crate::net::{InterfaceBinding, NetworkInterface};
use crate::task::TaskExecutors;

/// A NOTIFY announcement, classified by its NTS header.
#[derive(Debug, Clone)]
pub enum SsdpNotifyEvent {
    Alive(SsdpMessage),
    ByeBye(SsdpMessage),
    Update(SsdpMessage),
}

pub struct SsdpNotifyReceiver {
    server: SsdpServer,
}

impl SsdpNotifyReceiver {
    pub fn new(
        executors: Arc<TaskExecutors>,
        address: Address,
        interface: &NetworkInterface,
        listener: impl Fn(SsdpNotifyEvent) + Send + Sync + 'static,
    ) -> Result<Self, UpnpError> {
        let binding = address.find_interface_address(interface)?;
        let delegate = Arc::new(NotifyDelegate {
            binding,
            listener: Box::new(listener),
        });
        let server = SsdpServer::with_port(executors, delegate, address, interface, SSDP_PORT)?;
        Ok(Self { server })
    }

    pub fn open(&self) -> Result<(), UpnpError> {
        self.server.open()
    }

    pub fn close(&self) {
        self.server.close()
    }

    pub fn start(&self) -> Result<(), UpnpError> {
        self.server.start()
    }

    pub fn stop(&self) {
        self.server.stop()
    }

    pub fn interface_binding(&self) -> &InterfaceBinding {
        self.server.interface_binding()
    }
}

struct NotifyDelegate {
    binding: InterfaceBinding,
    listener: Box<dyn Fn(SsdpNotifyEvent) + Send + Sync>,
}

impl Receiver for NotifyDelegate {
    fn on_receive(&self, source_address: SocketAddr, data: &[u8]) {
        let message = match SsdpMessage::parse(data, source_address, &self.binding) {
            Ok(message) => message,
            Err(err) => {
                trace!("Dropping datagram from {}: {}", source_address, err);
                return;
            }
        };
        if !message.is_notify() {
            // M-SEARCH queries from other control points land here too.
            trace!(
                "Ignoring non-NOTIFY message from {}: {}",
                source_address,
                message.start_line()
            );
            return;
        }
        let event = match message.nts() {
            Some(nts) if nts.eq_ignore_ascii_case(NTS_ALIVE) => SsdpNotifyEvent::Alive(message),
            Some(nts) if nts.eq_ignore_ascii_case(NTS_BYEBYE) => SsdpNotifyEvent::ByeBye(message),
            Some(nts) if nts.eq_ignore_ascii_case(NTS_UPDATE) => SsdpNotifyEvent::Update(message),
            other => {
                trace!("Unknown NTS from {}: {:?}", source_address, other);
                return;
            }
        };
        (self.listener)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    fn delegate_with_log() -> (NotifyDelegate, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let delegate = NotifyDelegate {
            binding: InterfaceBinding::for_test(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)), 24),
            listener: Box::new(move |event| {
                let tag = match event {
                    SsdpNotifyEvent::Alive(m) => format!("alive:{}", m.uuid()),
                    SsdpNotifyEvent::ByeBye(m) => format!("byebye:{}", m.uuid()),
                    SsdpNotifyEvent::Update(m) => format!("update:{}", m.uuid()),
                };
                sink.lock().unwrap().push(tag);
            }),
        };
        (delegate, log)
    }

    fn source() -> SocketAddr {
        "192.0.2.2:1900".parse().unwrap()
    }

    #[test]
    fn test_classifies_nts() {
        let (delegate, log) = delegate_with_log();
        for nts in ["ssdp:alive", "ssdp:byebye", "ssdp:update"] {
            let frame = format!(
                "NOTIFY * HTTP/1.1\r\nNT: upnp:rootdevice\r\nNTS: {}\r\nUSN: uuid:42\r\n\r\n",
                nts
            );
            delegate.on_receive(source(), frame.as_bytes());
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["alive:uuid:42", "byebye:uuid:42", "update:uuid:42"]
        );
    }

    #[test]
    fn test_ignores_searches_and_garbage() {
        let (delegate, log) = delegate_with_log();
        delegate.on_receive(
            source(),
            b"M-SEARCH * HTTP/1.1\r\nMAN: \"ssdp:discover\"\r\nST: ssdp:all\r\n\r\n",
        );
        delegate.on_receive(source(), b"NOTIFY * HTTP/1.1\r\nNTS: ssdp:unknown\r\n\r\n");
        delegate.on_receive(source(), b"\xff\xfe");
        assert!(log.lock().unwrap().is_empty());
    }
}
