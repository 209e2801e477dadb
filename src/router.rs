//! HTTP Server: serves device/service descriptions and icons, dispatches SOAP control
//! invocations, and drives GENA SUBSCRIBE/UNSUBSCRIBE.
//!
//! A single [`Router::fallback`] resolves `(method, path)` against the live [`Tree`] at request
//! time rather than a fixed compile-time route table. Two things rule a static route table out
//! here: every path below a root device's UDN is only known once the tree is built from an
//! arbitrary application-supplied description, and SUBSCRIBE/UNSUBSCRIBE are not among the
//! verbs `axum::routing::MethodFilter` can register — a `fallback` handler that inspects
//! `Method` itself is the only way to receive them at all.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::Router;
use reqwest::Url;

use crate::action::{ActionError, ActionPayload, ActionResponse, InArgumentPayload, SoapMessage};
use crate::eventing;
use crate::subscription::{Sid, SubscriptionError, SubscriptionErrorKind, SubscriptionManager, Timeout};
use crate::tree::Tree;

/// Shared axum state: the built tree plus flat lookup tables for the three GET-able resource
/// kinds, built once so the fallback handler never walks the tree to serve a static document.
#[derive(Clone)]
pub struct AppState {
    tree: Arc<Tree>,
    subscriptions: SubscriptionManager,
    descriptions: Arc<HashMap<String, Arc<[u8]>>>,
    scpds: Arc<HashMap<String, Arc<[u8]>>>,
    icons: Arc<HashMap<String, (String, Arc<[u8]>)>>,
}

impl AppState {
    pub fn new(tree: Arc<Tree>, subscriptions: SubscriptionManager) -> Self {
        let mut descriptions = HashMap::new();
        let mut scpds = HashMap::new();
        let mut icons = HashMap::new();

        for device in tree.all_devices() {
            if let Some(bytes) = &device.description_bytes {
                descriptions.insert(format!("/{}/description.xml", device.udn), bytes.clone());
            }
            for icon in &device.icons {
                icons.insert(icon.url.clone(), (icon.mimetype.clone(), icon.bytes.clone()));
            }
        }
        for service in tree.all_services() {
            scpds.insert(service.scpd_path.clone(), service.scpd_bytes.clone());
        }

        Self {
            tree,
            subscriptions,
            descriptions: Arc::new(descriptions),
            scpds: Arc::new(scpds),
            icons: Arc::new(icons),
        }
    }
}

pub fn build(state: AppState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

async fn dispatch(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();
    match method.as_str() {
        "GET" => get_resource(&state, path),
        "POST" => control(&state, path, &headers, &body).await,
        "SUBSCRIBE" => subscribe(&state, path, peer, &headers).await,
        "UNSUBSCRIBE" => unsubscribe(&state, path, &headers).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

fn xml_response(bytes: Arc<[u8]>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/xml; charset=\"utf-8\"")],
        bytes.to_vec(),
    )
        .into_response()
}

fn get_resource(state: &AppState, path: &str) -> Response {
    if let Some(bytes) = state.descriptions.get(path) {
        return xml_response(bytes.clone());
    }
    if let Some(bytes) = state.scpds.get(path) {
        return xml_response(bytes.clone());
    }
    if let Some((mimetype, bytes)) = state.icons.get(path) {
        return ([(header::CONTENT_TYPE, mimetype.clone())], bytes.to_vec()).into_response();
    }
    StatusCode::NOT_FOUND.into_response()
}

async fn control(state: &AppState, path: &str, headers: &HeaderMap, body: &[u8]) -> Response {
    let Some(service) = state.tree.service_for_control_path(path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !headers.contains_key("soapaction") {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let payload = match SoapMessage::<ActionPayload<InArgumentPayload>>::from_xml(body) {
        Ok(message) => message.into_inner(),
        Err(err) => {
            tracing::warn!(%path, "malformed control request body: {err}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let Some(action_entry) = service.action(&payload.name) else {
        tracing::debug!(%path, action = %payload.name, "unknown action");
        return ActionError::not_found().into_response();
    };

    let scanner = action_entry.descriptor.input_scanner(payload.arguments);
    match (action_entry.handler)(service, scanner).await {
        Ok(values) => ActionResponse {
            action_name: action_entry.descriptor.name().to_string(),
            service_type: service.service_type.clone(),
            arguments: action_entry.descriptor.map_out_arguments(values),
        }
        .into_response(),
        Err(err) => err.into_response(),
    }
}

/// `CALLBACK: <url1><url2>` — each angle-bracketed segment is one callback URL.
fn parse_callbacks(raw: &str) -> Vec<Url> {
    raw.split('<')
        .filter_map(|chunk| chunk.split('>').next())
        .filter(|candidate| !candidate.is_empty())
        .filter_map(|candidate| candidate.parse().ok())
        .collect()
}

fn http_date_now() -> String {
    let format = time::format_description::parse_borrowed::<2>(
        "[weekday repr:short], [day padding:zero] [month repr:short] [year] [hour]:[minute]:[second] GMT",
    )
    .expect("infallible");
    time::OffsetDateTime::now_utc()
        .format(&format)
        .expect("infallible")
}

fn subscription_error_response(kind: SubscriptionErrorKind) -> Response {
    SubscriptionError(kind).status().into_response()
}

fn subscribe_success_response(sid: &Sid, timeout: Timeout) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        "SID",
        sid.to_string()
            .parse()
            .expect("sid is a well-formed header token"),
    );
    headers.insert(
        "TIMEOUT",
        timeout
            .to_string()
            .parse()
            .expect("timeout is a well-formed header token"),
    );
    headers.insert(
        "DATE",
        http_date_now()
            .parse()
            .expect("http-date is a well-formed header token"),
    );
    (StatusCode::OK, headers).into_response()
}

async fn subscribe(state: &AppState, path: &str, peer: SocketAddr, headers: &HeaderMap) -> Response {
    let Some(service) = state.tree.service_for_event_path(path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let nt = headers.get("nt").and_then(|v| v.to_str().ok());
    let callback = headers.get("callback").and_then(|v| v.to_str().ok());
    let sid_header = headers.get("sid").and_then(|v| v.to_str().ok());
    // Missing TIMEOUT is treated as requesting the maximum clamp rather than an unbounded
    // subscription: GENA leaves the default to publisher discretion.
    let timeout = headers
        .get("timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Timeout>().ok())
        .unwrap_or(Timeout::Seconds(1800));

    let is_initial = nt.is_some() || callback.is_some();
    let is_renewal = sid_header.is_some();

    if is_initial && is_renewal {
        return subscription_error_response(SubscriptionErrorKind::IncompatibleHeaderField);
    }

    if is_renewal {
        let Some(sid) = sid_header.and_then(|s| s.parse::<Sid>().ok()) else {
            return subscription_error_response(SubscriptionErrorKind::UnknownSid);
        };
        return match state.subscriptions.renew(&sid, peer, timeout).await {
            Ok(timeout) => subscribe_success_response(&sid, timeout),
            Err(err) => err.status().into_response(),
        };
    }

    if nt != Some("upnp:event") {
        return subscription_error_response(SubscriptionErrorKind::PreconditionFailed);
    }
    let callbacks = callback.map(parse_callbacks).unwrap_or_default();
    if callbacks.is_empty() {
        return subscription_error_response(SubscriptionErrorKind::PreconditionFailed);
    }

    let initial_body = eventing::initial_property_set(service).await;
    match state
        .subscriptions
        .create(service, peer, callbacks, timeout, initial_body)
        .await
    {
        Ok((sid, timeout)) => subscribe_success_response(&sid, timeout),
        Err(err) => err.status().into_response(),
    }
}

async fn unsubscribe(state: &AppState, path: &str, headers: &HeaderMap) -> Response {
    if state.tree.service_for_event_path(path).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    if headers.contains_key("nt") || headers.contains_key("callback") {
        return subscription_error_response(SubscriptionErrorKind::IncompatibleHeaderField);
    }
    let Some(sid) = headers
        .get("sid")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<Sid>().ok())
    else {
        return subscription_error_response(SubscriptionErrorKind::UnknownSid);
    };

    match state.subscriptions.unsubscribe(&sid).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => err.status().into_response(),
    }
}
