//! Subscription Manager: per-service subscriber table and per-subscription delivery/expiry
//! state machine.
//!
//! Each subscription owns a single-flight delivery task draining an `mpsc` queue, so NOTIFYs to
//! one callback are strictly serialized without blocking other subscribers, and a separate
//! expiry task that a renew can reset without touching `seq`.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SubscriptionPolicy;
use crate::tree::{ServiceKey, ServiceNode};

const MIN_TIMEOUT_SECS: u32 = 30;
const MAX_TIMEOUT_SECS: u32 = 1800;

/// `SID: uuid:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sid(uuid::Uuid);

impl Sid {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uuid:{}", self.0)
    }
}

impl FromStr for Sid {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = s
            .strip_prefix("uuid:")
            .ok_or_else(|| anyhow::anyhow!("sid must start with uuid:"))?
            .parse()?;
        Ok(Self(uuid))
    }
}

/// `TIMEOUT: Second-<n>` or `Second-infinite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Seconds(u32),
    Infinite,
}

impl Timeout {
    /// Clamped to [30, 1800] seconds; `Infinite` passes through unclamped.
    pub fn clamped(self) -> Self {
        match self {
            Timeout::Seconds(n) => Timeout::Seconds(n.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS)),
            Timeout::Infinite => Timeout::Infinite,
        }
    }

    fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::Seconds(n) => Some(Duration::from_secs(n as u64)),
            Timeout::Infinite => None,
        }
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Seconds(n) => write!(f, "Second-{n}"),
            Timeout::Infinite => write!(f, "Second-infinite"),
        }
    }
}

impl FromStr for Timeout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("Second-infinite") {
            return Ok(Timeout::Infinite);
        }
        let n = s
            .strip_prefix("Second-")
            .ok_or_else(|| anyhow::anyhow!("expected Second-<n> or Second-infinite, got {s}"))?
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid TIMEOUT value: {s}"))?;
        Ok(Timeout::Seconds(n))
    }
}

/// HTTP status taxonomy for SUBSCRIBE/UNSUBSCRIBE failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionErrorKind {
    /// SID header present together with NT/CALLBACK, or vice versa.
    IncompatibleHeaderField,
    /// CALLBACK missing/invalid, or NT != upnp:event.
    PreconditionFailed,
    /// `SubscriptionPolicy` returned `false`.
    PolicyRejected,
    /// SID unknown on UNSUBSCRIBE or renewal.
    UnknownSid,
}

#[derive(Debug, Clone, Copy)]
pub struct SubscriptionError(pub SubscriptionErrorKind);

impl SubscriptionError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            SubscriptionErrorKind::IncompatibleHeaderField => StatusCode::BAD_REQUEST,
            SubscriptionErrorKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            SubscriptionErrorKind::PolicyRejected => StatusCode::FORBIDDEN,
            SubscriptionErrorKind::UnknownSid => StatusCode::PRECONDITION_FAILED,
        }
    }
}

impl fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription error: {:?}", self.0)
    }
}

impl std::error::Error for SubscriptionError {}

/// Next seq after `n`, wrapping `0xFFFFFFFF` to `1` (`0` stays reserved for the initial NOTIFY).
fn next_seq(n: u32) -> u32 {
    if n == u32::MAX {
        1
    } else {
        n + 1
    }
}

struct Timer {
    deadline: Mutex<Option<Instant>>,
    notify: Notify,
}

struct Row {
    service: ServiceKey,
    callbacks: Vec<reqwest::Url>,
    seq: AtomicU32,
    delivery_tx: mpsc::UnboundedSender<Arc<[u8]>>,
    timer: Arc<Timer>,
    cancellation: CancellationToken,
}

struct Inner {
    table: RwLock<HashMap<Sid, Arc<Row>>>,
    http: reqwest::Client,
    policy: SubscriptionPolicy,
}

/// Cheaply clonable handle; every clone shares the same subscriber table.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    pub fn new(policy: SubscriptionPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: RwLock::new(HashMap::new()),
                http: reqwest::Client::new(),
                policy,
            }),
        }
    }

    /// Initial SUBSCRIBE. `initial_body` is the property-set XML covering
    /// every evented state variable; it is enqueued before this returns, guaranteeing it is
    /// delivered ahead of any change-driven NOTIFY for the same subscription.
    pub async fn create(
        &self,
        service: &ServiceNode,
        peer: SocketAddr,
        callbacks: Vec<reqwest::Url>,
        timeout: Timeout,
        initial_body: Arc<[u8]>,
    ) -> Result<(Sid, Timeout), SubscriptionError> {
        if callbacks.is_empty() {
            return Err(SubscriptionError(SubscriptionErrorKind::PreconditionFailed));
        }
        if !(self.inner.policy)(service, peer, true) {
            return Err(SubscriptionError(SubscriptionErrorKind::PolicyRejected));
        }

        let sid = Sid::new();
        let timeout = timeout.clamped();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let timer = Arc::new(Timer {
            deadline: Mutex::new(timeout.as_duration().map(|d| Instant::now() + d)),
            notify: Notify::new(),
        });
        let cancellation = CancellationToken::new();

        let row = Arc::new(Row {
            service: service.key,
            callbacks,
            seq: AtomicU32::new(0),
            delivery_tx,
            timer: timer.clone(),
            cancellation: cancellation.clone(),
        });

        self.spawn_delivery_task(sid.clone(), row.clone(), delivery_rx);
        self.spawn_timer_task(sid.clone(), timer, cancellation);

        row.delivery_tx
            .send(initial_body)
            .expect("delivery task just spawned, receiver alive");

        self.inner.table.write().await.insert(sid.clone(), row);
        tracing::info!(%sid, service = ?service.service_id, "subscription created");
        Ok((sid, timeout))
    }

    /// Renewal SUBSCRIBE: resets the deadline, leaves `seq` untouched, does
    /// not re-send the initial NOTIFY.
    pub async fn renew(
        &self,
        sid: &Sid,
        peer: SocketAddr,
        timeout: Timeout,
    ) -> Result<Timeout, SubscriptionError> {
        let table = self.inner.table.read().await;
        let row = table
            .get(sid)
            .ok_or(SubscriptionError(SubscriptionErrorKind::UnknownSid))?
            .clone();
        drop(table);

        // Renewal has no per-service context beyond what create() already validated; look the
        // row's service key up is unnecessary here since policy only inspects the service node
        // shape, and a renewing peer is already a known subscriber.
        let _ = peer;

        let timeout = timeout.clamped();
        *row.timer.deadline.lock().await = timeout.as_duration().map(|d| Instant::now() + d);
        row.timer.notify.notify_one();
        tracing::debug!(%sid, "subscription renewed");
        Ok(timeout)
    }

    pub async fn unsubscribe(&self, sid: &Sid) -> Result<(), SubscriptionError> {
        let row = self
            .inner
            .table
            .write()
            .await
            .remove(sid)
            .ok_or(SubscriptionError(SubscriptionErrorKind::UnknownSid))?;
        row.cancellation.cancel();
        tracing::info!(%sid, "subscription removed");
        Ok(())
    }

    /// Enqueues `body` to every active subscriber of `service`. Each subscriber's own delivery task serializes its NOTIFYs.
    pub async fn notify_service(&self, service: ServiceKey, body: Arc<[u8]>) {
        let table = self.inner.table.read().await;
        for row in table.values().filter(|r| r.service == service) {
            let _ = row.delivery_tx.send(body.clone());
        }
    }

    /// Cancels every subscription's timer and delivery task without sending a final NOTIFY;
    /// used by the Host Orchestrator during `quit()`.
    pub async fn shutdown(&self) {
        let mut table = self.inner.table.write().await;
        for row in table.values() {
            row.cancellation.cancel();
        }
        table.clear();
    }

    fn spawn_delivery_task(
        &self,
        sid: Sid,
        row: Arc<Row>,
        mut rx: mpsc::UnboundedReceiver<Arc<[u8]>>,
    ) {
        let http = self.inner.http.clone();
        let cancellation = row.cancellation.clone();
        tokio::spawn(async move {
            loop {
                let body = tokio::select! {
                    _ = cancellation.cancelled() => break,
                    body = rx.recv() => match body {
                        Some(body) => body,
                        None => break,
                    },
                };
                let seq = row.seq.load(Ordering::SeqCst);
                let mut delivered = false;
                for callback in &row.callbacks {
                    match http
                        .request(Method::from_bytes(b"NOTIFY").expect("valid method"), callback.clone())
                        .header("NT", "upnp:event")
                        .header("NTS", "upnp:propchange")
                        .header("SID", sid.to_string())
                        .header("SEQ", seq.to_string())
                        .header("CONTENT-TYPE", "text/xml; charset=\"utf-8\"")
                        .body(body.to_vec())
                        .send()
                        .await
                    {
                        Ok(response) => {
                            tracing::debug!(%sid, %callback, status = %response.status(), "notify delivered");
                            delivered = true;
                            break;
                        }
                        Err(err) => {
                            tracing::warn!(%sid, %callback, "notify delivery failed: {err}");
                        }
                    }
                }
                if !delivered {
                    tracing::warn!(%sid, "all callbacks failed for this notify, subscription retained");
                }
                // seq advances on any HTTP response, success or not;
                // it also advances here when every callback failed to connect at all, since a
                // dropped subscriber must not desynchronize the seq the next NOTIFY carries.
                row.seq.store(next_seq(seq), Ordering::SeqCst);
            }
        });
    }

    fn spawn_timer_task(&self, sid: Sid, timer: Arc<Timer>, cancellation: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let deadline = *timer.deadline.lock().await;
                match deadline {
                    None => {
                        tokio::select! {
                            _ = cancellation.cancelled() => return,
                            _ = timer.notify.notified() => continue,
                        }
                    }
                    Some(deadline) => {
                        tokio::select! {
                            _ = cancellation.cancelled() => return,
                            _ = timer.notify.notified() => continue,
                            _ = tokio::time::sleep_until(deadline) => {
                                manager.inner.table.write().await.remove(&sid);
                                // Without this the delivery task's `rx.recv()` never sees its
                                // sender drop (the removed table row's `Arc<Row>` was the only
                                // other holder of `delivery_tx`, and that row is gone now, but
                                // the delivery task itself still holds its own `Arc<Row>` clone)
                                // and blocks forever, leaking the task.
                                cancellation.cancel();
                                tracing::info!(%sid, "subscription expired");
                                return;
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{ActionEntry, DeviceKey, StateVariableCell};
    use crate::urn::{ResourceType, ServiceId};

    fn test_service(key: usize) -> ServiceNode {
        let (change_tx, _rx) = mpsc::unbounded_channel();
        ServiceNode {
            key: ServiceKey::for_test(key),
            device: DeviceKey::for_test(0),
            service_id: ServiceId::new("schemas-upnp-org", "SwitchPower"),
            service_type: ResourceType::service("schemas-upnp-org", "SwitchPower", 1),
            scpd_path: "/uuid:test/SwitchPower/scpd.xml".into(),
            control_path: "/uuid:test/SwitchPower/control".into(),
            event_path: "/uuid:test/SwitchPower/event".into(),
            actions: HashMap::<String, ActionEntry>::new(),
            variables: HashMap::<String, StateVariableCell>::new(),
            variable_order: Vec::new(),
            evented: true,
            scpd_bytes: Arc::from(&b""[..]),
            change_tx,
        }
    }

    #[test]
    fn seq_wraps_past_u32_max() {
        assert_eq!(next_seq(0), 1);
        assert_eq!(next_seq(41), 42);
        assert_eq!(next_seq(u32::MAX), 1);
    }

    #[test]
    fn timeout_round_trips_and_clamps() {
        let t: Timeout = "Second-300".parse().unwrap();
        assert_eq!(t.to_string(), "Second-300");
        assert_eq!(Timeout::Seconds(5).clamped(), Timeout::Seconds(30));
        assert_eq!(Timeout::Seconds(100_000).clamped(), Timeout::Seconds(1800));
        let inf: Timeout = "Second-infinite".parse().unwrap();
        assert_eq!(inf.clamped(), Timeout::Infinite);
    }

    #[tokio::test]
    async fn create_rejects_empty_callbacks() {
        let manager = SubscriptionManager::new(Arc::new(|_s, _p, _new| true));
        let service = test_service(1);
        let peer: SocketAddr = "192.0.2.99:8080".parse().unwrap();
        let err = manager
            .create(&service, peer, vec![], Timeout::Seconds(300), Arc::from(&b""[..]))
            .await
            .unwrap_err();
        assert_eq!(err.0, SubscriptionErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn create_respects_policy_rejection() {
        let manager = SubscriptionManager::new(Arc::new(|_s, _p, _new| false));
        let service = test_service(1);
        let peer: SocketAddr = "192.0.2.99:8080".parse().unwrap();
        let callback: reqwest::Url = "http://192.0.2.99:8080/cb".parse().unwrap();
        let err = manager
            .create(
                &service,
                peer,
                vec![callback],
                Timeout::Seconds(300),
                Arc::from(&b""[..]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.0, SubscriptionErrorKind::PolicyRejected);
    }

    #[tokio::test]
    async fn create_then_unsubscribe_removes_sid() {
        let manager = SubscriptionManager::new(Arc::new(|_s, _p, _new| true));
        let service = test_service(1);
        let peer: SocketAddr = "192.0.2.99:8080".parse().unwrap();
        let callback: reqwest::Url = "http://192.0.2.99:8080/cb".parse().unwrap();
        let (sid, timeout) = manager
            .create(
                &service,
                peer,
                vec![callback],
                Timeout::Seconds(300),
                Arc::from(&b""[..]),
            )
            .await
            .unwrap();
        assert_eq!(timeout, Timeout::Seconds(300));
        manager.unsubscribe(&sid).await.unwrap();
        let err = manager.unsubscribe(&sid).await.unwrap_err();
        assert_eq!(err.0, SubscriptionErrorKind::UnknownSid);
    }
}
