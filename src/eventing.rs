//! Event Notifier: turns state-variable writes into GENA property-set NOTIFYs.
//!
//! One task per service here drains that service's `StateChange` channel — the same
//! `mpsc::UnboundedSender<StateChange>` every `ServiceNode::set_variable` call writes to. A
//! batch of changes that arrive before the task gets back around to `.await` is coalesced into
//! a single property-set document, which keeps state-change events ordered per service without
//! an explicit lock around emission.

use std::sync::Arc;

use quick_xml::events::{BytesDecl, BytesStart, Event};
use tokio_util::sync::CancellationToken;

use crate::tree::{ServiceChangeReceivers, ServiceNode, Tree};
use crate::subscription::SubscriptionManager;
use crate::IntoXml;

/// Builds a GENA property-set document covering exactly the given variable names, each rendered
/// at its current value. Names that aren't declared on `service` are silently skipped rather than
/// failing the whole NOTIFY — a state variable disappearing mid-flight isn't possible today, but
/// tolerating it here costs nothing and keeps this infallible for its callers.
async fn property_set(service: &ServiceNode, names: impl Iterator<Item = &str>) -> Vec<u8> {
    let mut w = quick_xml::Writer::new(Vec::new());
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("in-memory xml serialization does not fail");
    let root = BytesStart::new("e:propertyset")
        .with_attributes([("xmlns:e", "urn:schemas-upnp-org:event-1-0")]);
    let root_end = root.to_end().into_owned();
    w.write_event(Event::Start(root))
        .expect("in-memory xml serialization does not fail");

    for name in names {
        let Some(cell) = service.variable(name) else {
            continue;
        };
        let value = cell.get().await;
        let wrapper = BytesStart::new("e:property");
        let wrapper_end = wrapper.to_end().into_owned();
        w.write_event(Event::Start(wrapper))
            .expect("in-memory xml serialization does not fail");
        w.create_element(name)
            .write_inner_content(|w| value.write_xml(w))
            .expect("in-memory xml serialization does not fail");
        w.write_event(Event::End(wrapper_end))
            .expect("in-memory xml serialization does not fail");
    }

    w.write_event(Event::End(root_end))
        .expect("in-memory xml serialization does not fail");
    w.into_inner()
}

/// The initial NOTIFY body a SUBSCRIBE handler must enqueue ahead of any change-driven NOTIFY:
/// every evented state variable, regardless of whether it has ever changed.
pub async fn initial_property_set(service: &ServiceNode) -> Arc<[u8]> {
    let names: Vec<String> = service
        .evented_variable_names()
        .map(str::to_owned)
        .collect();
    property_set(service, names.iter().map(String::as_str))
        .await
        .into()
}

/// Drains one service's `StateChange` channel for the lifetime of the host, coalescing bursts of
/// changes into a single property-set per wakeup and handing it to the Subscription Manager.
/// Returns immediately; each service gets its own detached task, cancelled via `cancellation`.
pub fn spawn(
    tree: Arc<Tree>,
    subscriptions: SubscriptionManager,
    receivers: ServiceChangeReceivers,
    cancellation: CancellationToken,
) {
    for (service_key, mut rx) in receivers {
        let tree = tree.clone();
        let subscriptions = subscriptions.clone();
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    _ = cancellation.cancelled() => break,
                    change = rx.recv() => match change {
                        Some(change) => change,
                        None => break,
                    },
                };
                let mut changed = vec![first.variable];
                while let Ok(more) = rx.try_recv() {
                    if !changed.contains(&more.variable) {
                        changed.push(more.variable);
                    }
                }

                let service = tree.service(service_key);
                // Re-order the coalesced batch to match SCPD declaration order rather than
                // arrival order, per UDA's property-set ordering.
                let ordered: Vec<&str> = service
                    .variable_order
                    .iter()
                    .map(String::as_str)
                    .filter(|name| changed.iter().any(|c| c == name))
                    .collect();
                let body: Arc<[u8]> = property_set(service, ordered.into_iter()).await.into();
                subscriptions.notify_service(service_key, body).await;
            }
        });
    }
}
