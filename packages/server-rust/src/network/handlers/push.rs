//! WebSocket push endpoint.
//!
//! A session is authenticated and admitted before the upgrade, so a
//! rejected client gets a plain HTTP error. After the upgrade two halves run
//! until either ends: the writer drains the session queue onto the socket,
//! the reader applies filter frames sent by the client.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{Extensions, HeaderMap};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tidewire_core::{Encoding, PushFilter};

use super::rest::group_parameters;
use super::{error_response, AppState};
use crate::push::{PushMessage, PushSession, SessionRegistry};

pub async fn push_upgrade_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Query(query): Query<Vec<(String, String)>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.shutdown.health_state().accepts_requests() {
        return error_response(state.unavailable());
    }

    let mut session = state.push.new_session(headers, group_parameters(query));
    if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
        session = session.with_client_ip(addr.ip().to_string());
    }

    let registry = Arc::clone(state.push.registry());
    if let Err(err) = registry.authenticate(&session).await {
        tracing::debug!(session_id = %session.id(), code = err.code, "push session rejected");
        return error_response(err);
    }
    if let Err(err) = registry.init_session(&session).await {
        tracing::debug!(session_id = %session.id(), code = err.code, "push session refused");
        return error_response(err);
    }

    let session = Arc::new(session);
    ws.on_upgrade(move |socket| run_session(socket, session, registry))
}

fn frame(message: PushMessage) -> Message {
    match message.encoding {
        Encoding::Json => match String::from_utf8(message.data.to_vec()) {
            Ok(text) => Message::Text(text.into()),
            Err(_) => Message::Binary(message.data),
        },
        Encoding::MsgPack => Message::Binary(message.data),
    }
}

/// Decodes a filter frame. An empty frame clears the filter.
fn apply_filter(session: &PushSession, data: &[u8]) {
    if data.is_empty() {
        session.set_filter(None);
        return;
    }
    match session.read_encoding().decode::<PushFilter>(data) {
        Ok(filter) => {
            tracing::debug!(session_id = %session.id(), "push filter updated");
            session.set_filter(Some(filter));
        }
        Err(err) => {
            tracing::warn!(session_id = %session.id(), error = %err, "ignoring undecodable filter frame");
        }
    }
}

async fn run_session(socket: WebSocket, session: Arc<PushSession>, registry: Arc<SessionRegistry>) {
    registry.register(Arc::clone(&session));
    let (mut sink, mut stream) = socket.split();

    let writer = async {
        while let Some(message) = session.next_message().await {
            if let Err(err) = sink.send(frame(message)).await {
                tracing::debug!(session_id = %session.id(), error = %err, "push write failed");
                break;
            }
        }
        session.close();
        let _ = sink.send(Message::Close(None)).await;
    };

    let reader = async {
        loop {
            let next = tokio::select! {
                () = session.closed() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => apply_filter(&session, text.as_str().as_bytes()),
                Some(Ok(Message::Binary(data))) => apply_filter(&session, &data),
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            }
        }
        session.close();
    };

    tokio::join!(writer, reader);
    registry.unregister(&session);
}
