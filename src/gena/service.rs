//! The slice of a UPnP service description the eventing layer needs.

use std::net::IpAddr;

use url::Url;

use crate::errors::UpnpError;

/// Key identifying a service across devices: (device UDN, service id).
pub(crate) type ServiceKey = (String, String);

/// Immutable descriptor of a subscribable service. The full device/service
/// model lives in the description layer; eventing only needs the event-sub
/// endpoint and the interface the device was discovered on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    udn: String,
    service_id: String,
    service_type: String,
    event_sub_url: String,
    interface_address: IpAddr,
}

impl Service {
    /// `event_sub_url` must be an absolute `http` URL; `interface_address`
    /// is the address of the interface the device's announcement arrived on
    /// and feeds the CALLBACK header.
    pub fn new(
        udn: &str,
        service_id: &str,
        service_type: &str,
        event_sub_url: &str,
        interface_address: IpAddr,
    ) -> Result<Self, UpnpError> {
        if udn.is_empty() {
            return Err(UpnpError::InvalidMessage("service UDN is empty".to_string()));
        }
        if service_id.is_empty() {
            return Err(UpnpError::InvalidMessage(
                "service id is empty".to_string(),
            ));
        }
        let url = Url::parse(event_sub_url).map_err(|err| {
            UpnpError::InvalidMessage(format!("bad eventSubURL '{}': {}", event_sub_url, err))
        })?;
        if url.scheme() != "http" {
            return Err(UpnpError::InvalidMessage(format!(
                "eventSubURL is not http: {}",
                event_sub_url
            )));
        }
        Ok(Self {
            udn: udn.to_string(),
            service_id: service_id.to_string(),
            service_type: service_type.to_string(),
            event_sub_url: event_sub_url.to_string(),
            interface_address,
        })
    }

    pub fn udn(&self) -> &str {
        &self.udn
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn event_sub_url(&self) -> &str {
        &self.event_sub_url
    }

    pub fn interface_address(&self) -> IpAddr {
        self.interface_address
    }

    pub(crate) fn key(&self) -> ServiceKey {
        (self.udn.clone(), self.service_id.clone())
    }
}
