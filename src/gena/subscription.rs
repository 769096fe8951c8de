//! One GENA lease: the SID the device issued, when it started, and how long
//! it lasts. Owned by the manager registry; the service descriptor is only
//! weakly referenced so an evicted device does not linger here.

use std::cmp;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::service::Service;

/// Renew ahead of expiry by the larger of 10 s and a tenth of the lease.
pub(crate) fn renewal_margin(lease: Duration) -> Duration {
    cmp::max(Duration::from_secs(10), lease / 10)
}

#[derive(Clone)]
pub struct Subscription {
    service: Weak<Service>,
    sid: String,
    start: Instant,
    timeout: Duration,
    keep_renew: bool,
}

impl Subscription {
    pub(crate) fn new(
        service: &Arc<Service>,
        sid: &str,
        timeout: Duration,
        keep_renew: bool,
    ) -> Self {
        Self {
            service: Arc::downgrade(service),
            sid: sid.to_string(),
            start: Instant::now(),
            timeout,
            keep_renew,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn expires_at(&self) -> Instant {
        self.start + self.timeout
    }

    pub fn keep_renew(&self) -> bool {
        self.keep_renew
    }

    pub(crate) fn service(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }

    /// When the scheduler must act: ahead of expiry for auto-renewed leases,
    /// at expiry for the rest. Leases shorter than the margin are due
    /// immediately.
    pub(crate) fn due_at(&self) -> Instant {
        if self.keep_renew {
            self.expires_at()
                .checked_sub(renewal_margin(self.timeout))
                .unwrap_or(self.start)
                .max(self.start)
        } else {
            self.expires_at()
        }
    }

    pub(crate) fn renewed(&mut self, timeout: Duration) {
        self.start = Instant::now();
        self.timeout = timeout;
    }

    pub(crate) fn set_keep_renew(&mut self, keep_renew: bool) {
        self.keep_renew = keep_renew;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn service() -> Arc<Service> {
        Arc::new(
            Service::new(
                "uuid:device-1",
                "urn:upnp-org:serviceId:ContentDirectory",
                "urn:schemas-upnp-org:service:ContentDirectory:1",
                "http://192.0.2.2/event",
                "192.0.2.5".parse::<IpAddr>().unwrap(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_renewal_margin() {
        assert_eq!(
            renewal_margin(Duration::from_secs(1800)),
            Duration::from_secs(180)
        );
        // 10% would be 3 s; the 10 s floor wins.
        assert_eq!(
            renewal_margin(Duration::from_secs(30)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_due_ahead_of_expiry_when_renewing() {
        let service = service();
        let sub = Subscription::new(&service, "uuid:sub-1", Duration::from_secs(1800), true);
        assert_eq!(sub.expires_at(), sub.start() + Duration::from_secs(1800));
        assert_eq!(sub.due_at(), sub.start() + Duration::from_secs(1620));

        let passive = Subscription::new(&service, "uuid:sub-2", Duration::from_secs(1800), false);
        assert_eq!(passive.due_at(), passive.expires_at());
    }

    #[test]
    fn test_short_lease_due_immediately() {
        let service = service();
        let sub = Subscription::new(&service, "uuid:sub-1", Duration::from_secs(1), true);
        assert_eq!(sub.due_at(), sub.start());
    }

    #[test]
    fn test_weak_service_reference() {
        let service = service();
        let sub = Subscription::new(&service, "uuid:sub-1", Duration::from_secs(300), true);
        assert!(sub.service().is_some());
        drop(service);
        assert!(sub.service().is_none());
    }
}
