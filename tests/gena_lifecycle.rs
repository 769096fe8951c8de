//! End-to-end GENA wiring: the event receiver hands NOTIFY callbacks to the
//! subscription manager's registry, and accepted events reach user code
//! through the callback executor in order.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use upnp_cp::gena::{EventNotification, EventReceiver, Service, SubscribeManager};
use upnp_cp::http::{HttpClient, HttpRequest, HttpResponse};
use upnp_cp::task::TaskExecutors;

struct ScriptedHttpClient {
    responses: Mutex<VecDeque<HttpResponse>>,
}

impl ScriptedHttpClient {
    fn new(responses: Vec<HttpResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
        })
    }
}

impl HttpClient for ScriptedHttpClient {
    fn post(&self, _request: &HttpRequest) -> io::Result<HttpResponse> {
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| HttpResponse::new(500)))
    }
}

fn notify_request(sid: &str, seq: u32, body: &str) -> String {
    format!(
        "NOTIFY /event HTTP/1.1\r\n\
         HOST: 127.0.0.1\r\n\
         NT: upnp:event\r\n\
         NTS: upnp:propchange\r\n\
         SID: {}\r\n\
         SEQ: {}\r\n\
         CONTENT-LENGTH: {}\r\n\
         \r\n{}",
        sid,
        seq,
        body.len(),
        body
    )
}

fn send_notify(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(request.as_bytes()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[test]
fn test_subscription_event_flow() {
    let executors = Arc::new(TaskExecutors::new());
    let manager_slot: Arc<OnceLock<Arc<SubscribeManager>>> = Arc::new(OnceLock::new());
    let delivered: Arc<Mutex<Vec<(String, u64, Vec<(String, String)>)>>> =
        Arc::new(Mutex::new(Vec::new()));

    // The receiver validates the SID against the manager registry and
    // forwards accepted notifications through the callback pool.
    let handler_slot = Arc::clone(&manager_slot);
    let handler_executors = Arc::clone(&executors);
    let handler_sink = Arc::clone(&delivered);
    let receiver = EventReceiver::spawn(&executors, move |event: EventNotification| {
        let Some(manager) = handler_slot.get() else {
            return false;
        };
        if manager.service_by_sid(&event.sid).is_none() {
            return false;
        }
        let sink = Arc::clone(&handler_sink);
        handler_executors.callback(move || {
            sink.lock()
                .unwrap()
                .push((event.sid, event.seq, event.properties));
        })
    })
    .unwrap();

    let client = ScriptedHttpClient::new(vec![
        HttpResponse::new(200)
            .with_header("SID", "uuid:sub-abc")
            .with_header("TIMEOUT", "Second-1800"),
        HttpResponse::new(200),
    ]);
    let manager = Arc::new(SubscribeManager::new(
        Arc::clone(&executors),
        client,
        receiver.local_port(),
    ));
    manager_slot.set(Arc::clone(&manager)).ok().unwrap();

    let service = Arc::new(
        Service::new(
            "uuid:device-1",
            "urn:upnp-org:serviceId:ContentDirectory",
            "urn:schemas-upnp-org:service:ContentDirectory:1",
            "http://192.0.2.2:8080/event",
            "127.0.0.1".parse().unwrap(),
        )
        .unwrap(),
    );
    assert!(manager.subscribe(&service, true));

    // The registry resolves the issued SID back to the subscribed service.
    let resolved = manager.service_by_sid("uuid:sub-abc").unwrap();
    assert_eq!(
        resolved.service_type(),
        "urn:schemas-upnp-org:service:ContentDirectory:1"
    );
    assert_eq!(resolved.udn(), "uuid:device-1");

    let body = "<?xml version=\"1.0\"?>\
        <e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\">\
        <e:property><SystemUpdateID>9</SystemUpdateID></e:property>\
        </e:propertyset>";

    // Unknown SID first: rejected, never delivered.
    let rejected = send_notify(
        receiver.local_port(),
        &notify_request("uuid:stranger", 0, body),
    );
    assert!(rejected.starts_with("HTTP/1.1 412"));

    let accepted = send_notify(
        receiver.local_port(),
        &notify_request("uuid:sub-abc", 1, body),
    );
    assert!(accepted.starts_with("HTTP/1.1 200"));

    let deadline = Instant::now() + Duration::from_secs(2);
    while delivered.lock().unwrap().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let events = delivered.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "uuid:sub-abc");
    assert_eq!(events[0].1, 1);
    assert_eq!(
        events[0].2,
        vec![("SystemUpdateID".to_string(), "9".to_string())]
    );
    drop(events);

    // Unsubscribing removes the lease; further notifies are rejected.
    assert!(manager.unsubscribe(&service));
    assert!(manager.subscription_of(&service).is_none());
    let after = send_notify(
        receiver.local_port(),
        &notify_request("uuid:sub-abc", 2, body),
    );
    assert!(after.starts_with("HTTP/1.1 412"));
}
