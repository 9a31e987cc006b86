//! Turns a finished [`Context`] or an [`ApiError`] into a transport response.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, LOCATION};
use http::{HeaderName, HeaderValue, Response, StatusCode};
use tidewire_core::{ApiError, Encoding, EntityList, Operation};

use super::context::{Context, Output, OutputData, Request};

pub const HEADER_COUNT_TOTAL: HeaderName = HeaderName::from_static("x-count-total");
pub const HEADER_MESSAGES: HeaderName = HeaderName::from_static("x-messages");
pub const HEADER_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Status used when the processor did not set one.
#[must_use]
pub fn default_status(operation: Operation) -> StatusCode {
    match operation {
        Operation::Create => StatusCode::CREATED,
        Operation::Info => StatusCode::NO_CONTENT,
        _ => StatusCode::OK,
    }
}

/// Builds the response of a successful dispatch.
#[must_use]
pub fn success(ctx: &Context, subject: &str) -> Response<Bytes> {
    let request = ctx.request();
    let operation = request.operation;

    let mut response = match ctx.output() {
        Some(Output::Raw(raw)) => {
            let mut response = Response::new(raw.body.clone());
            *response.status_mut() =
                StatusCode::from_u16(raw.status).unwrap_or(StatusCode::OK);
            if let Ok(value) = HeaderValue::from_str(&raw.content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Some(Output::Data(data)) => {
            let encoded = match data {
                OutputData::Entity(entity) => request.accept.encode(entity.as_ref()),
                OutputData::List(list) => request.accept.encode(&EntityList(list)),
            };
            match encoded {
                Ok(body) => {
                    let mut response = Response::new(Bytes::from(body));
                    *response.status_mut() = status_of(ctx);
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static(request.accept.content_type()),
                    );
                    response
                }
                Err(err) => {
                    tracing::error!(error = %err, "unable to encode output");
                    return failure(
                        &ApiError::internal(err.to_string(), subject),
                        request,
                    );
                }
            }
        }
        None => {
            let mut response = Response::new(Bytes::new());
            *response.status_mut() = if matches!(
                operation,
                Operation::Create | Operation::Patch | Operation::Info
            ) {
                StatusCode::NO_CONTENT
            } else {
                status_of(ctx)
            };
            response
        }
    };

    let headers = response.headers_mut();
    if let Some(location) = ctx.redirect() {
        match HeaderValue::from_str(location) {
            Ok(value) => {
                headers.insert(LOCATION, value);
                *response.status_mut() = StatusCode::FOUND;
            }
            Err(_) => tracing::warn!(location, "ignoring invalid redirect location"),
        }
    }

    let headers = response.headers_mut();
    if matches!(operation, Operation::RetrieveMany | Operation::Info) {
        headers.insert(HEADER_COUNT_TOTAL, HeaderValue::from(ctx.count()));
    }
    let messages = ctx.messages();
    if !messages.is_empty() {
        match HeaderValue::from_str(&messages.join(";")) {
            Ok(value) => {
                headers.insert(HEADER_MESSAGES, value);
            }
            Err(_) => tracing::warn!("dropping messages that are not valid header values"),
        }
    }
    insert_request_id(headers, request);
    response
}

/// Builds an error response. The body is a list holding `err`, in the
/// encoding the client accepts.
#[must_use]
pub fn failure(err: &ApiError, request: &Request) -> Response<Bytes> {
    let mut err = err.clone();
    if err.trace.is_none() {
        err.trace = Some(request.request_id.clone());
    }
    let errors = [err];

    let (body, encoding) = match request.accept.encode(&errors[..]) {
        Ok(body) => (body, request.accept),
        Err(_) => (
            serde_json::to_vec(&errors[..]).unwrap_or_default(),
            Encoding::Json,
        ),
    };

    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() =
        StatusCode::from_u16(errors[0].code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(encoding.content_type()),
    );
    insert_request_id(response.headers_mut(), request);
    response
}

fn status_of(ctx: &Context) -> StatusCode {
    ctx.status_code()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or_else(|| default_status(ctx.operation()))
}

fn insert_request_id(headers: &mut http::HeaderMap, request: &Request) {
    if let Ok(value) = HeaderValue::from_str(&request.request_id) {
        headers.insert(HEADER_REQUEST_ID, value);
    }
}
