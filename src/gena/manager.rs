//! SUBSCRIBE / RENEW / UNSUBSCRIBE state machine and the background
//! scheduler that keeps leases alive.
//!
//! All operations collapse to a boolean: GENA failures are ordinary on
//! consumer networks and the caller decides whether to retry. The scheduler
//! is a single thread sleeping until the earliest due lease; registry
//! changes wake it through the condvar.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use super::service::{Service, ServiceKey};
use super::subscription::Subscription;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::task::TaskExecutors;

/// Lease requested from devices and substituted for `infinite` responses.
const DEFAULT_LEASE: Duration = Duration::from_secs(300);

const REQUESTED_TIMEOUT: &str = "Second-300";

pub type ExpiredListener = Arc<dyn Fn(Arc<Service>) + Send + Sync>;

pub struct SubscribeManager {
    inner: Arc<ManagerInner>,
}

impl SubscribeManager {
    /// `event_port` is the local port NOTIFY callbacks are served on; it
    /// lands in the CALLBACK header of every SUBSCRIBE.
    pub fn new(
        executors: Arc<TaskExecutors>,
        client: Arc<dyn HttpClient>,
        event_port: u16,
    ) -> Self {
        let inner = Arc::new(ManagerInner {
            registry: Mutex::new(Registry {
                subscriptions: HashMap::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
            client,
            executors: Arc::clone(&executors),
            event_port,
            expired_listener: Mutex::new(None),
        });
        let scheduler = Arc::clone(&inner);
        if !executors.server("-subscription", move || scheduler.run_scheduler()) {
            warn!("Subscription scheduler not started, executors are terminated");
        }
        Self { inner }
    }

    /// Called (through the callback pool) when a lease lapses without a
    /// successful renewal.
    pub fn set_expired_listener(&self, listener: impl Fn(Arc<Service>) + Send + Sync + 'static) {
        *self.inner.expired_listener.lock().unwrap() = Some(Arc::new(listener));
    }

    /// SUBSCRIBE, or RENEW when the service already holds a lease. With
    /// `keep_renew` the scheduler renews ahead of every expiry.
    pub fn subscribe(&self, service: &Arc<Service>, keep_renew: bool) -> bool {
        match self.inner.sid_of(service) {
            Some(sid) => {
                if self.inner.renew_with_sid(service, &sid) {
                    self.inner.update_keep_renew(service, keep_renew);
                    true
                } else {
                    false
                }
            }
            None => self.inner.subscribe_new(service, keep_renew),
        }
    }

    /// RENEW the current lease, or SUBSCRIBE without auto-renewal when no
    /// lease is held.
    pub fn renew_subscribe(&self, service: &Arc<Service>) -> bool {
        match self.inner.sid_of(service) {
            Some(sid) => self.inner.renew_with_sid(service, &sid),
            None => self.inner.subscribe_new(service, false),
        }
    }

    /// UNSUBSCRIBE and forget the lease.
    pub fn unsubscribe(&self, service: &Arc<Service>) -> bool {
        let Some(sid) = self.inner.sid_of(service) else {
            return false;
        };
        match self.inner.try_unsubscribe(service, &sid) {
            Ok(()) => {
                self.inner.remove(&service.key());
                true
            }
            Err(err) => {
                warn!(
                    service = service.service_id(),
                    error = %err,
                    "UNSUBSCRIBE failed"
                );
                false
            }
        }
    }

    /// Snapshot of the current lease, if any.
    pub fn subscription_of(&self, service: &Service) -> Option<Subscription> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .subscriptions
            .get(&service.key())
            .cloned()
    }

    /// Resolve an incoming NOTIFY's SID to its service.
    pub fn service_by_sid(&self, sid: &str) -> Option<Arc<Service>> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .find(|sub| sub.sid() == sid)
            .and_then(|sub| sub.service())
    }

    /// Stop the scheduler. Held leases are left to lapse on the device side.
    pub fn terminate(&self) {
        let mut registry = self.inner.registry.lock().unwrap();
        registry.shutdown = true;
        self.inner.wake.notify_all();
    }
}

impl Drop for SubscribeManager {
    fn drop(&mut self) {
        self.terminate();
    }
}

struct Registry {
    subscriptions: HashMap<ServiceKey, Subscription>,
    shutdown: bool,
}

struct ManagerInner {
    registry: Mutex<Registry>,
    wake: Condvar,
    client: Arc<dyn HttpClient>,
    executors: Arc<TaskExecutors>,
    event_port: u16,
    expired_listener: Mutex<Option<ExpiredListener>>,
}

impl ManagerInner {
    fn sid_of(&self, service: &Service) -> Option<String> {
        self.registry
            .lock()
            .unwrap()
            .subscriptions
            .get(&service.key())
            .map(|sub| sub.sid().to_string())
    }

    fn subscribe_new(&self, service: &Arc<Service>, keep_renew: bool) -> bool {
        match self.try_subscribe(service, keep_renew) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    service = service.service_id(),
                    error = %err,
                    "SUBSCRIBE failed"
                );
                false
            }
        }
    }

    fn try_subscribe(&self, service: &Arc<Service>, keep_renew: bool) -> Result<()> {
        let request = HttpRequest::new("SUBSCRIBE", service.event_sub_url())
            .header("NT", "upnp:event")
            .header("CALLBACK", &callback_header(service, self.event_port))
            .header("TIMEOUT", REQUESTED_TIMEOUT)
            .header("CONTENT-LENGTH", "0");
        let response = self
            .client
            .post(&request)
            .context("SUBSCRIBE request failed")?;
        if response.status() != 200 {
            bail!("SUBSCRIBE returned HTTP {}", response.status());
        }
        let sid = response
            .header("SID")
            .filter(|s| !s.is_empty())
            .context("SUBSCRIBE response missing SID")?
            .to_string();
        let timeout = parse_timeout(&response).context("SUBSCRIBE response TIMEOUT invalid")?;

        let mut registry = self.registry.lock().unwrap();
        registry
            .subscriptions
            .insert(service.key(), Subscription::new(service, &sid, timeout, keep_renew));
        self.wake.notify_all();
        debug!(
            service = service.service_id(),
            sid = sid.as_str(),
            "Subscribed for {}s",
            timeout.as_secs()
        );
        Ok(())
    }

    fn renew_with_sid(&self, service: &Arc<Service>, sid: &str) -> bool {
        match self.try_renew(service, sid) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    service = service.service_id(),
                    error = %err,
                    "RENEW failed"
                );
                false
            }
        }
    }

    fn try_renew(&self, service: &Arc<Service>, sid: &str) -> Result<()> {
        let request = HttpRequest::new("SUBSCRIBE", service.event_sub_url())
            .header("SID", sid)
            .header("TIMEOUT", REQUESTED_TIMEOUT)
            .header("CONTENT-LENGTH", "0");
        let response = self.client.post(&request).context("RENEW request failed")?;
        if response.status() != 200 {
            bail!("RENEW returned HTTP {}", response.status());
        }
        let returned = response
            .header("SID")
            .filter(|s| !s.is_empty())
            .context("RENEW response missing SID")?;
        if returned != sid {
            // The device rotated the subscription; only a fresh SUBSCRIBE
            // can recover.
            bail!("RENEW returned a different SID ({})", returned);
        }
        let timeout = parse_timeout(&response).context("RENEW response TIMEOUT invalid")?;

        // A concurrent unsubscribe wins over this in-flight renewal.
        let mut registry = self.registry.lock().unwrap();
        match registry.subscriptions.get_mut(&service.key()) {
            Some(sub) if sub.sid() == sid => {
                sub.renewed(timeout);
                self.wake.notify_all();
                Ok(())
            }
            _ => bail!("subscription no longer registered"),
        }
    }

    fn try_unsubscribe(&self, service: &Service, sid: &str) -> Result<()> {
        let request = HttpRequest::new("UNSUBSCRIBE", service.event_sub_url())
            .header("SID", sid)
            .header("CONTENT-LENGTH", "0");
        let response = self
            .client
            .post(&request)
            .context("UNSUBSCRIBE request failed")?;
        if response.status() != 200 {
            bail!("UNSUBSCRIBE returned HTTP {}", response.status());
        }
        Ok(())
    }

    fn update_keep_renew(&self, service: &Service, keep_renew: bool) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(sub) = registry.subscriptions.get_mut(&service.key()) {
            sub.set_keep_renew(keep_renew);
            self.wake.notify_all();
        }
    }

    fn remove(&self, key: &ServiceKey) {
        let mut registry = self.registry.lock().unwrap();
        if registry.subscriptions.remove(key).is_some() {
            self.wake.notify_all();
        }
    }

    /// Remove only if the lease is still the one we acted on; a concurrent
    /// re-subscribe keeps its fresh entry.
    fn remove_if_sid(&self, key: &ServiceKey, sid: &str) -> bool {
        let mut registry = self.registry.lock().unwrap();
        match registry.subscriptions.get(key) {
            Some(sub) if sub.sid() == sid => {
                registry.subscriptions.remove(key);
                self.wake.notify_all();
                true
            }
            _ => false,
        }
    }

    fn emit_expired(&self, service: Arc<Service>) {
        let Some(listener) = self.expired_listener.lock().unwrap().clone() else {
            return;
        };
        if !self.executors.callback(move || listener(service)) {
            debug!("Expired notification dropped, callback executor terminated");
        }
    }

    fn run_scheduler(&self) {
        let mut registry = self.registry.lock().unwrap();
        loop {
            if registry.shutdown {
                return;
            }
            let now = Instant::now();
            let due: Vec<(ServiceKey, Subscription)> = registry
                .subscriptions
                .iter()
                .filter(|(_, sub)| sub.due_at() <= now)
                .map(|(key, sub)| (key.clone(), sub.clone()))
                .collect();

            if due.is_empty() {
                let next = registry.subscriptions.values().map(|s| s.due_at()).min();
                registry = match next {
                    Some(at) => {
                        let timeout = at.saturating_duration_since(now);
                        self.wake.wait_timeout(registry, timeout).unwrap().0
                    }
                    None => self.wake.wait(registry).unwrap(),
                };
                continue;
            }

            drop(registry);
            for (key, sub) in due {
                let Some(service) = sub.service() else {
                    // The service descriptor is gone; nothing to notify.
                    self.remove(&key);
                    continue;
                };
                if sub.keep_renew() {
                    if !self.renew_with_sid(&service, sub.sid())
                        && self.remove_if_sid(&key, sub.sid())
                    {
                        self.emit_expired(service);
                    }
                } else if sub.expires_at() <= Instant::now()
                    && self.remove_if_sid(&key, sub.sid())
                {
                    self.emit_expired(service);
                }
            }
            registry = self.registry.lock().unwrap();
        }
    }
}

/// `<http://<local-ip>[:<event-port>]/>`, port omitted on the HTTP default.
fn callback_header(service: &Service, event_port: u16) -> String {
    let host = match service.interface_address() {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    };
    if event_port == 80 {
        format!("<http://{}/>", host)
    } else {
        format!("<http://{}:{}/>", host, event_port)
    }
}

/// `Second-<N>` to a lease duration. `infinite` (deprecated since UPnP 1.1)
/// maps to the default lease; anything else is a failed subscribe.
fn parse_timeout(response: &HttpResponse) -> Option<Duration> {
    let value = response.header("TIMEOUT")?.trim().to_ascii_lowercase();
    if value.contains("infinite") {
        return Some(DEFAULT_LEASE);
    }
    let idx = value.find("second-")?;
    let seconds: u64 = value[idx + "second-".len()..].parse().ok()?;
    Some(Duration::from_secs(seconds))
}
