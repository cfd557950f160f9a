//! Mock manifests and payloads

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Payload served for every healthy item
pub const ITEM_PAYLOAD: &[u8] = b"\x00\x01item-payload\xff";

/// URL of `leaf` in `group` on `server`
pub fn item_url(server: &MockServer, group: &str, leaf: &str) -> String {
    format!("{}/items/{group}/{leaf}", server.uri())
}

/// Mount the batch manifest and one manifest per group
///
/// Each manifest is served exactly once; every later lookup must come from
/// the loader caches.
pub async fn mount_batch(server: &MockServer, groups: &[(&str, &[&str])]) {
    let batch: Vec<_> = groups.iter().map(|(id, _)| json!({ "id": id })).collect();
    Mock::given(method("GET"))
        .and(path("/batch.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(batch))
        .expect(1)
        .mount(server)
        .await;

    for (group, leaves) in groups {
        let items: Vec<_> = leaves
            .iter()
            .map(|leaf| json!({ "id": leaf, "url": item_url(server, group, leaf) }))
            .collect();
        Mock::given(method("GET"))
            .and(path(format!("/groups/{group}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(items))
            .expect(1)
            .mount(server)
            .await;
    }
}

/// Serve `leaf` of `group` with `status`, expecting exactly `hits` requests
pub async fn mount_item(server: &MockServer, group: &str, leaf: &str, status: u16, hits: u64) {
    let response = if (200..300).contains(&status) {
        ResponseTemplate::new(status).set_body_bytes(ITEM_PAYLOAD.to_vec())
    } else {
        ResponseTemplate::new(status).set_body_string("upstream error")
    };
    Mock::given(method("GET"))
        .and(path(format!("/items/{group}/{leaf}")))
        .respond_with(response)
        .expect(hits)
        .mount(server)
        .await;
}

/// Serve `leaf` of `group` with 503 for the first `failures` requests, then the payload once
pub async fn mount_flaky_item(server: &MockServer, group: &str, leaf: &str, failures: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/items/{group}/{leaf}")))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(failures)
        .expect(failures)
        .mount(server)
        .await;
    mount_item(server, group, leaf, 200, 1).await;
}
