//! Per-request state threaded through the dispatch pipeline.
//!
//! A [`Request`] is the immutable description of what the client asked for.
//! A [`Context`] wraps it with everything the pipeline and the processor
//! produce along the way: decoded input, output, status, total count,
//! messages, side-channel events, claims and metadata. One `Context` belongs
//! to exactly one in-flight dispatch; messages and events are the only
//! fields shared through interior locking so that helper tasks spawned by a
//! processor can enqueue them.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;
use tidewire_core::{Encoding, Entity, Event, Identity, Operation};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Immutable description of an inbound operation.
#[derive(Debug, Clone)]
pub struct Request {
    /// Unique id, echoed in responses and error traces.
    pub request_id: String,
    pub operation: Operation,
    /// Identity of the targeted objects.
    pub identity: Identity,
    /// Target object for retrieve/update/delete/patch.
    pub object_id: Option<String>,
    /// Parent the operation is nested under; root for top-level routes.
    pub parent_identity: Identity,
    pub parent_id: Option<String>,
    /// Raw request body.
    pub data: Bytes,
    /// Encoding of `data`.
    pub encoding: Encoding,
    /// Encoding the client wants the response in.
    pub accept: Encoding,
    pub headers: HeaderMap,
    /// Query parameters, multi-valued.
    pub parameters: HashMap<String, Vec<String>>,
    pub client_ip: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub order: Vec<String>,
}

impl Request {
    /// Creates a request for `operation` on `identity` at the root, with a
    /// fresh request id and no body.
    #[must_use]
    pub fn new(operation: Operation, identity: Identity) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            operation,
            identity,
            object_id: None,
            parent_identity: Identity::root(),
            parent_id: None,
            data: Bytes::new(),
            encoding: Encoding::Json,
            accept: Encoding::Json,
            headers: HeaderMap::new(),
            parameters: HashMap::new(),
            client_ip: None,
            page: None,
            page_size: None,
            order: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_parent(mut self, identity: Identity, id: impl Into<String>) -> Self {
        self.parent_identity = identity;
        self.parent_id = Some(id.into());
        self
    }

    /// Sets the body and its encoding. Responses default to the same encoding.
    #[must_use]
    pub fn with_data(mut self, encoding: Encoding, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self.encoding = encoding;
        self.accept = encoding;
        self
    }

    #[must_use]
    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    /// First value of query parameter `key`.
    #[must_use]
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Value of header `key`, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Structured output produced by a processor.
#[derive(Debug, Clone)]
pub enum OutputData {
    Entity(Arc<dyn Entity>),
    List(Vec<Arc<dyn Entity>>),
}

impl OutputData {
    /// The single entity, if this is not a list.
    #[must_use]
    pub fn entity(&self) -> Option<&dyn Entity> {
        match self {
            Self::Entity(entity) => Some(entity.as_ref()),
            Self::List(_) => None,
        }
    }
}

/// A response the processor writes itself, bypassing encoding.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

/// What a processor hands back: structured data or a raw response, never both.
#[derive(Debug, Clone)]
pub enum Output {
    Data(OutputData),
    Raw(RawResponse),
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Mutable state of one dispatch.
#[derive(Debug)]
pub struct Context {
    request: Arc<Request>,
    input_data: Option<Arc<dyn Entity>>,
    output: Option<Output>,
    status_code: Option<u16>,
    count: usize,
    redirect: Option<String>,
    messages: Mutex<Vec<String>>,
    events: Mutex<Vec<Event>>,
    claims: Vec<String>,
    claims_map: HashMap<String, String>,
    metadata: HashMap<String, Arc<dyn Any + Send + Sync>>,
    disable_output_push: bool,
}

impl Context {
    #[must_use]
    pub fn new(request: Request) -> Self {
        Self {
            request: Arc::new(request),
            input_data: None,
            output: None,
            status_code: None,
            count: 0,
            redirect: None,
            messages: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            claims: Vec::new(),
            claims_map: HashMap::new(),
            metadata: HashMap::new(),
            disable_output_push: false,
        }
    }

    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        self.request.operation
    }

    /// Decoded body, set by the pipeline for create, update and patch.
    #[must_use]
    pub fn input_data(&self) -> Option<&dyn Entity> {
        self.input_data.as_deref()
    }

    /// Decoded body downcast to `T`.
    #[must_use]
    pub fn input<T: Entity>(&self) -> Option<&T> {
        self.input_data().and_then(|e| e.downcast_ref::<T>())
    }

    pub(crate) fn set_input_data(&mut self, entity: Box<dyn Entity>) {
        self.input_data = Some(Arc::from(entity));
    }

    #[must_use]
    pub fn output(&self) -> Option<&Output> {
        self.output.as_ref()
    }

    /// Structured output, if any was set.
    #[must_use]
    pub fn output_data(&self) -> Option<&OutputData> {
        match &self.output {
            Some(Output::Data(data)) => Some(data),
            _ => None,
        }
    }

    /// Sets a single entity as output.
    ///
    /// # Panics
    ///
    /// Panics if a raw response was already set.
    pub fn set_output_entity(&mut self, entity: impl Entity) {
        self.set_output_data(OutputData::Entity(Arc::new(entity)));
    }

    /// Sets a list of entities as output.
    ///
    /// # Panics
    ///
    /// Panics if a raw response was already set.
    pub fn set_output_list(&mut self, entities: Vec<Arc<dyn Entity>>) {
        self.set_output_data(OutputData::List(entities));
    }

    /// Sets structured output.
    ///
    /// # Panics
    ///
    /// Panics if a raw response was already set.
    pub fn set_output_data(&mut self, data: OutputData) {
        assert!(
            !matches!(self.output, Some(Output::Raw(_))),
            "output data cannot be set once a raw response has been written"
        );
        self.output = Some(Output::Data(data));
    }

    /// Removes any structured output.
    pub fn clear_output_data(&mut self) {
        if matches!(self.output, Some(Output::Data(_))) {
            self.output = None;
        }
    }

    /// Sets a raw response.
    ///
    /// # Panics
    ///
    /// Panics if structured output was already set.
    pub fn set_raw_response(&mut self, response: RawResponse) {
        assert!(
            !matches!(self.output, Some(Output::Data(_))),
            "a raw response cannot be written once output data has been set"
        );
        self.output = Some(Output::Raw(response));
    }

    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Overrides the default status code of the operation.
    pub fn set_status_code(&mut self, code: u16) {
        self.status_code = Some(code);
    }

    /// Total number of objects, surfaced for retrieve-many and info.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn set_count(&mut self, count: usize) {
        self.count = count;
    }

    #[must_use]
    pub fn redirect(&self) -> Option<&str> {
        self.redirect.as_deref()
    }

    pub fn set_redirect(&mut self, location: impl Into<String>) {
        self.redirect = Some(location.into());
    }

    /// Adds a message returned to the client alongside the response.
    pub fn add_message(&self, message: impl Into<String>) {
        self.messages.lock().push(message.into());
    }

    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    /// Enqueues side-channel events, published in order after the processor
    /// returns successfully.
    pub fn enqueue_events(&self, events: impl IntoIterator<Item = Event>) {
        self.events.lock().extend(events);
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub(crate) fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    #[must_use]
    pub fn claims(&self) -> &[String] {
        &self.claims
    }

    /// Claims parsed as `key=value` pairs. Later duplicates win.
    #[must_use]
    pub fn claims_map(&self) -> &HashMap<String, String> {
        &self.claims_map
    }

    /// Sets the caller's claims, typically from an authenticator.
    pub fn set_claims(&mut self, claims: Vec<String>) {
        self.claims_map = parse_claims(&claims);
        self.claims = claims;
    }

    /// Stores an opaque value for later steps of the pipeline.
    pub fn set_metadata<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.metadata.insert(key.into(), Arc::new(value));
    }

    /// Retrieves a value stored with [`Context::set_metadata`].
    #[must_use]
    pub fn metadata<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.metadata
            .get(key)
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    #[must_use]
    pub fn disable_output_push(&self) -> bool {
        self.disable_output_push
    }

    /// Prevents the implicit event for this operation's output.
    pub fn set_disable_output_push(&mut self, disabled: bool) {
        self.disable_output_push = disabled;
    }

    /// Copies the context with independent collections. The request and the
    /// entities themselves are shared.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            request: Arc::clone(&self.request),
            input_data: self.input_data.clone(),
            output: self.output.clone(),
            status_code: self.status_code,
            count: self.count,
            redirect: self.redirect.clone(),
            messages: Mutex::new(self.messages()),
            events: Mutex::new(self.events()),
            claims: self.claims.clone(),
            claims_map: self.claims_map.clone(),
            metadata: self.metadata.clone(),
            disable_output_push: self.disable_output_push,
        }
    }
}

pub(crate) fn parse_claims(claims: &[String]) -> HashMap<String, String> {
    claims
        .iter()
        .filter_map(|claim| claim.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde::Serialize;

    use super::*;

    #[derive(Debug, Clone, Serialize)]
    struct Note {
        id: String,
    }

    impl Entity for Note {
        fn identity(&self) -> Identity {
            Identity::new("note", "notes")
        }

        fn identifier(&self) -> String {
            self.id.clone()
        }
    }

    fn ctx() -> Context {
        Context::new(Request::new(
            Operation::Create,
            Identity::new("note", "notes"),
        ))
    }

    #[test]
    fn claims_are_parsed_into_a_map() {
        let mut ctx = ctx();
        ctx.set_claims(vec![
            "realm=test".to_string(),
            "malformed".to_string(),
            "org=acme".to_string(),
        ]);
        assert_eq!(ctx.claims().len(), 3);
        assert_eq!(ctx.claims_map().get("realm").unwrap(), "test");
        assert_eq!(ctx.claims_map().get("org").unwrap(), "acme");
        assert!(!ctx.claims_map().contains_key("malformed"));
    }

    #[test]
    fn metadata_round_trips_by_type() {
        let mut ctx = ctx();
        ctx.set_metadata("attempt", 3_u32);
        assert_eq!(*ctx.metadata::<u32>("attempt").unwrap(), 3);
        assert!(ctx.metadata::<String>("attempt").is_none());
        assert!(ctx.metadata::<u32>("missing").is_none());
    }

    #[test]
    fn duplicate_has_independent_collections() {
        let mut ctx = ctx();
        ctx.add_message("first");
        ctx.set_claims(vec!["a=b".to_string()]);

        let copy = ctx.duplicate();
        copy.add_message("second");
        ctx.set_claims(vec![]);

        assert_eq!(ctx.messages(), vec!["first"]);
        assert_eq!(copy.messages(), vec!["first", "second"]);
        assert_eq!(copy.claims(), &["a=b".to_string()]);
        assert_eq!(copy.request().request_id, ctx.request().request_id);
    }

    #[test]
    fn clear_output_data_keeps_raw_responses() {
        let mut ctx = ctx();
        ctx.set_output_entity(Note { id: "1".into() });
        ctx.clear_output_data();
        assert!(ctx.output().is_none());

        ctx.set_raw_response(RawResponse {
            status: 202,
            content_type: "text/plain".into(),
            body: Bytes::from_static(b"queued"),
        });
        ctx.clear_output_data();
        assert!(matches!(ctx.output(), Some(Output::Raw(_))));
    }

    #[test]
    #[should_panic(expected = "raw response cannot be written")]
    fn raw_response_after_data_is_a_programming_error() {
        let mut ctx = ctx();
        ctx.set_output_entity(Note { id: "1".into() });
        ctx.set_raw_response(RawResponse {
            status: 200,
            content_type: "text/plain".into(),
            body: Bytes::new(),
        });
    }

    #[test]
    #[should_panic(expected = "output data cannot be set")]
    fn data_after_raw_response_is_a_programming_error() {
        let mut ctx = ctx();
        ctx.set_raw_response(RawResponse {
            status: 200,
            content_type: "text/plain".into(),
            body: Bytes::new(),
        });
        ctx.set_output_entity(Note { id: "1".into() });
    }

    #[test]
    fn request_accessors() {
        let mut request = Request::new(Operation::RetrieveMany, Identity::new("note", "notes"))
            .with_parent(Identity::new("list", "lists"), "l1");
        request
            .parameters
            .insert("q".to_string(), vec!["x".to_string(), "y".to_string()]);
        request
            .headers
            .insert("x-namespace", http::HeaderValue::from_static("/acme"));

        assert_eq!(request.parameter("q"), Some("x"));
        assert_eq!(request.header("x-namespace"), Some("/acme"));
        assert_eq!(request.parent_id.as_deref(), Some("l1"));
        assert!(uuid::Uuid::parse_str(&request.request_id).is_ok());
    }
}
