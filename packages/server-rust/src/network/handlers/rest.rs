//! CRUD routes.
//!
//! | Route                                 | Method | Operation      |
//! |---------------------------------------|--------|----------------|
//! | `/{category}`                         | GET    | retrieve-many  |
//! | `/{category}`                         | POST   | create         |
//! | `/{category}`                         | HEAD   | info           |
//! | `/{category}/{id}`                    | GET    | retrieve       |
//! | `/{category}/{id}`                    | PUT    | update         |
//! | `/{category}/{id}`                    | DELETE | delete         |
//! | `/{category}/{id}`                    | PATCH  | patch          |
//! | `/{parent_category}/{parent_id}/{category}` | GET, POST, HEAD | as `/{category}` |

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{Extensions, HeaderMap, Method};
use axum::response::Response;
use tidewire_core::{ApiError, Encoding, Identity, Operation};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use super::{error_response, AppState};
use crate::network::middleware::REQUEST_ID_HEADER;
use crate::service::response;
use crate::service::{DispatchCall, Request};

/// Where a request points, as parsed from its path.
#[derive(Debug, Default)]
struct Target {
    category: String,
    object_id: Option<String>,
    parent: Option<(String, String)>,
}

/// Maps an HTTP method onto an operation. Object routes take
/// retrieve/update/delete/patch, collection routes the rest.
#[must_use]
pub fn operation_for(method: &Method, on_object: bool) -> Option<Operation> {
    let operation = match (method.as_str(), on_object) {
        ("GET", false) => Operation::RetrieveMany,
        ("POST", false) => Operation::Create,
        ("HEAD", false) => Operation::Info,
        ("GET", true) => Operation::Retrieve,
        ("PUT", true) => Operation::Update,
        ("DELETE", true) => Operation::Delete,
        ("PATCH", true) => Operation::Patch,
        _ => return None,
    };
    Some(operation)
}

pub async fn collection_handler(
    State(state): State<AppState>,
    Path(category): Path<String>,
    method: Method,
    headers: HeaderMap,
    extensions: Extensions,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let target = Target {
        category,
        ..Target::default()
    };
    handle(state, target, &method, headers, &extensions, query, body).await
}

pub async fn object_handler(
    State(state): State<AppState>,
    Path((category, id)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    extensions: Extensions,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let target = Target {
        category,
        object_id: Some(id),
        parent: None,
    };
    handle(state, target, &method, headers, &extensions, query, body).await
}

pub async fn nested_handler(
    State(state): State<AppState>,
    Path((parent_category, parent_id, category)): Path<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
    extensions: Extensions,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let target = Target {
        category,
        object_id: None,
        parent: Some((parent_category, parent_id)),
    };
    handle(state, target, &method, headers, &extensions, query, body).await
}

/// Collects repeated query keys into one multi-valued map.
pub(crate) fn group_parameters(query: Vec<(String, String)>) -> HashMap<String, Vec<String>> {
    let mut parameters: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in query {
        parameters.entry(key).or_default().push(value);
    }
    parameters
}

fn header_encoding(headers: &HeaderMap, name: axum::http::HeaderName) -> Option<Encoding> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(Encoding::from_content_type)
}

fn resolve(state: &AppState, category: &str) -> Result<Identity, ApiError> {
    state.models.identity_from_category(category).ok_or_else(|| {
        ApiError::not_found(
            format!("no resource named '{category}'"),
            state.service_name.as_ref(),
        )
    })
}

fn into_axum(response: http::Response<Bytes>) -> Response {
    response.map(Body::from)
}

#[allow(clippy::too_many_arguments)]
async fn handle(
    state: AppState,
    target: Target,
    method: &Method,
    headers: HeaderMap,
    extensions: &Extensions,
    query: Vec<(String, String)>,
    body: Bytes,
) -> Response {
    if !state.shutdown.health_state().accepts_requests() {
        return error_response(state.unavailable());
    }
    let Some(operation) = operation_for(method, target.object_id.is_some()) else {
        return error_response(ApiError::method_not_allowed(
            format!("{method} is not supported on this route"),
            state.service_name.as_ref(),
        ));
    };
    let identity = match resolve(&state, &target.category) {
        Ok(identity) => identity,
        Err(err) => return error_response(err),
    };

    let encoding = header_encoding(&headers, CONTENT_TYPE).unwrap_or_default();
    let mut request = Request::new(operation, identity).with_data(encoding, body);
    if let Some(accept) = header_encoding(&headers, ACCEPT) {
        request.accept = accept;
    }
    if let Some((parent_category, parent_id)) = target.parent {
        match resolve(&state, &parent_category) {
            Ok(parent) => request = request.with_parent(parent, parent_id),
            Err(err) => return into_axum(response::failure(&err, &request)),
        }
    }
    if let Some(id) = target.object_id {
        request = request.with_object_id(id);
    }
    if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
        request = request.with_client_ip(addr.ip().to_string());
    }
    if let Some(id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        request.request_id = id.to_string();
    }

    let parameters = group_parameters(query);
    request.page = parameters
        .get("page")
        .and_then(|values| values.first())
        .and_then(|value| value.parse().ok());
    request.page_size = parameters
        .get("page_size")
        .and_then(|values| values.first())
        .and_then(|value| value.parse().ok());
    request.order = parameters.get("order").cloned().unwrap_or_default();
    request.parameters = parameters;
    request.headers = headers;

    // Dropping this future (client gone) cancels the dispatch.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let _in_flight = state.shutdown.in_flight_guard();

    let call = DispatchCall::new(request.clone()).with_cancel(cancel);
    match state.pipeline.clone().oneshot(call).await {
        Ok(response) => into_axum(response),
        Err(err) => {
            let err = err.to_api_error(&state.service_name);
            into_axum(response::failure(&err, &request))
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::get;
    use axum::Router;

    use super::*;
    use crate::network::handlers::tests::test_state;
    use crate::network::ShutdownController;

    fn router(state: AppState) -> Router {
        Router::new()
            .route(
                "/{category}",
                get(collection_handler)
                    .post(collection_handler)
                    .head(collection_handler),
            )
            .route(
                "/{category}/{id}",
                get(object_handler)
                    .put(object_handler)
                    .delete(object_handler)
                    .patch(object_handler),
            )
            .with_state(state)
    }

    fn post(uri: &str, body: &'static str) -> HttpRequest<Body> {
        HttpRequest::post(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[test]
    fn methods_map_to_operations() {
        assert_eq!(operation_for(&Method::GET, false), Some(Operation::RetrieveMany));
        assert_eq!(operation_for(&Method::POST, false), Some(Operation::Create));
        assert_eq!(operation_for(&Method::HEAD, false), Some(Operation::Info));
        assert_eq!(operation_for(&Method::GET, true), Some(Operation::Retrieve));
        assert_eq!(operation_for(&Method::PUT, true), Some(Operation::Update));
        assert_eq!(operation_for(&Method::DELETE, true), Some(Operation::Delete));
        assert_eq!(operation_for(&Method::PATCH, true), Some(Operation::Patch));
        assert_eq!(operation_for(&Method::POST, true), None);
    }

    #[test]
    fn repeated_parameters_are_grouped() {
        let parameters = group_parameters(vec![
            ("order".to_string(), "name".to_string()),
            ("order".to_string(), "-id".to_string()),
            ("page".to_string(), "2".to_string()),
        ]);
        assert_eq!(parameters["order"], ["name", "-id"]);
        assert_eq!(parameters["page"], ["2"]);
    }

    #[tokio::test]
    async fn create_dispatches_to_the_processor() {
        let state = test_state();
        let response = router(state)
            .oneshot(post("/lists", r#"{"id":"1","name":"groceries"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn client_request_id_is_kept() {
        let state = test_state();
        let mut request = post("/lists", r#"{"id":"1","name":"a"}"#);
        request
            .headers_mut()
            .insert(REQUEST_ID_HEADER, "req-42".parse().unwrap());
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.headers()["x-request-id"], "req-42");
    }

    #[tokio::test]
    async fn unknown_category_is_not_found() {
        let state = test_state();
        let response = router(state)
            .oneshot(post("/nothing", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_body_is_a_bad_request() {
        let state = test_state();
        let response = router(state).oneshot(post("/lists", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_capability_is_not_implemented() {
        let state = test_state();
        let request = HttpRequest::get("/lists").body(Body::empty()).unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn draining_server_refuses_dispatches() {
        let state = AppState {
            shutdown: std::sync::Arc::new(ShutdownController::new()),
            ..test_state()
        };
        state.shutdown.trigger_shutdown();
        let response = router(state)
            .oneshot(post("/lists", r#"{"id":"1","name":"a"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
