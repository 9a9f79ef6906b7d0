//! Extras that only show up during tests.
#![allow(missing_docs)]

use http::{Request, Response, StatusCode};
use kube::client::{Body, Client};
use serde_json::json;

pub use test_log::test;

/// ApiServerHandle is the mock side of a [`Client`] built by [`mock_client`].
pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// Mock_client pairs a kube [`Client`] with the handle tests drive it from.
pub fn mock_client() -> (Client, ApiServerHandle) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(mock_service, "default"), handle)
}

/// Serve_one answers the next request with whatever `respond` builds and
/// returns the request for assertions.
///
/// NB: if the code under test makes more calls than the scenario serves, it
/// typically sees a `KubeError(Service(Closed(())))` once the handle drops.
pub async fn serve_one<F>(handle: &mut ApiServerHandle, respond: F) -> Request<Body>
where
    F: FnOnce(&Request<Body>) -> Response<Body>,
{
    let (request, send) = handle.next_request().await.expect("service not called");
    let response = respond(&request);
    send.send_response(response);
    request
}

/// Json_response wraps a serializable body with the given status.
pub fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(body).expect("serialize response"),
        ))
        .expect("build response")
}

/// Not_found is the Status document the API server returns for a missing
/// object.
pub fn not_found(name: &str) -> Response<Body> {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("{name} not found"),
            "reason": "NotFound",
            "code": 404,
        }),
    )
}

/// Invalid is the Status document for a rejected (dry-run) create.
pub fn invalid(name: &str) -> Response<Body> {
    json_response(
        StatusCode::UNPROCESSABLE_ENTITY,
        &json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("{name} is invalid"),
            "reason": "Invalid",
            "code": 422,
        }),
    )
}

/// Timeout_after_1s bounds a scenario task so a missing API call fails the
/// test instead of hanging it.
pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded");
}

/// Pods_resource is the built-in core/v1 pods endpoint.
pub fn pods_resource() -> kube::discovery::ApiResource {
    kube::discovery::ApiResource {
        group: String::new(),
        version: "v1".into(),
        api_version: "v1".into(),
        kind: "Pod".into(),
        plural: "pods".into(),
    }
}
