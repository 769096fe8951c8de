//! Ephemeral-port SSDP role: emits M-SEARCH probes and surfaces the unicast
//! responses devices send back.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::trace;

use super::message::SsdpMessage;
use super::server::{Receiver, SsdpServer};
use super::{Address, ST_ALL};
use crate::errors::UpnpError;
use crate::net::{InterfaceBinding, NetworkInterface};
use crate::task::TaskExecutors;

const SEARCH_MX: u32 = 3;

pub struct SsdpSearchServer {
    server: SsdpServer,
    address: Address,
}

impl SsdpSearchServer {
    pub fn new(
        executors: Arc<TaskExecutors>,
        address: Address,
        interface: &NetworkInterface,
        listener: impl Fn(SsdpMessage) + Send + Sync + 'static,
    ) -> Result<Self, UpnpError> {
        let binding = address.find_interface_address(interface)?;
        let delegate = Arc::new(ResponseDelegate {
            binding,
            listener: Box::new(listener),
        });
        let server = SsdpServer::new(executors, delegate, address, interface)?;
        Ok(Self { server, address })
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

    /// Multicast an M-SEARCH for the given search target; `None` or an
    /// empty target searches for everything.
    pub fn search(&self, st: Option<&str>) {
        let st = st.filter(|s| !s.is_empty()).unwrap_or(ST_ALL);
        self.server
            .send(SsdpMessage::m_search(self.address, st, SEARCH_MX));
    }
}

struct ResponseDelegate {
    binding: InterfaceBinding,
    listener: Box<dyn Fn(SsdpMessage) + Send + Sync>,
}

impl Receiver for ResponseDelegate {
    fn on_receive(&self, source_address: SocketAddr, data: &[u8]) {
        let message = match SsdpMessage::parse(data, source_address, &self.binding) {
            Ok(message) => message,
            Err(err) => {
                trace!("Dropping datagram from {}: {}", source_address, err);
                return;
            }
        };
        if !message.is_search_response() {
            trace!(
                "Ignoring non-response message from {}: {}",
                source_address,
                message.start_line()
            );
            return;
        }
        (self.listener)(message);
    }
}
