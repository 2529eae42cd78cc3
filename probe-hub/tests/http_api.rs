//! API-level tests against the real router, with a canned USB bus view and
//! temp directories for locks and staging. Anything that would exec into a
//! toolchain container is covered up to the point of execution.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use tower::ServiceExt;

use probe_hub::config::{Mode, Transport};
use probe_hub::inventory::{Inventory, UsbDevice, UsbSource};
use probe_hub::server::router;
use probe_hub::{DispatchRequest, Hub, HubConfig};

const CONFIG: &str = r#"
    [containers.wch]
    image = "probe-hub/wch:latest"

    [[probes]]
    id = 3
    name = "WCH-LinkE rig"
    serial = "WCH1"
    vid = "1a86"
    pid = "8010"
    interface = "wch-link"

    [targets.ch32v203]
    description = "WCH CH32V203"
    container = "wch"

    [targets.ch32v203.compatible_probes]
    debug = ["wch-link"]
    flash = ["wch-link"]

    [targets.ch32v203.transports.wch-link]
    default = "sdi"
    allowed = ["sdi"]

    [targets.ch32v203.commands.wch-link]
    debug = "wlink -s {serial} gdb --port {gdb_port} --transport {transport}"
    flash = "wlink -s {serial} flash {firmware_path}"
"#;

#[derive(Debug)]
struct FakeBus(Vec<UsbDevice>);

impl UsbSource for FakeBus {
    fn devices(&self) -> Vec<UsbDevice> {
        self.0.clone()
    }
}

fn wch_link() -> UsbDevice {
    UsbDevice {
        vid: 0x1a86,
        pid: 0x8010,
        serial: Some("WCH1".into()),
    }
}

fn hub(devices: Vec<UsbDevice>, lock_dir: &Path, staging_dir: &Path) -> Arc<Hub> {
    let mut config = HubConfig::from_toml_str(CONFIG).unwrap();
    config.locks.dir = lock_dir.to_path_buf();
    config.staging.dir = staging_dir.to_path_buf();
    Arc::new(Hub::with_inventory(
        config,
        Inventory::with_source(Box::new(FakeBus(devices))),
    ))
}

fn multipart(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> (String, Vec<u8>) {
    let boundary = "hub-integration-boundary";
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((filename, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

async fn json_of(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn staging_is_empty(dir: &Path) -> bool {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.count() == 0,
        Err(_) => true,
    }
}

#[tokio::test]
async fn unsupported_transport_is_rejected_and_default_applies() {
    let locks = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let hub = hub(vec![wch_link()], locks.path(), staging.path());

    let (content_type, body) = multipart(
        &[
            ("target", "ch32v203"),
            ("probe", "3"),
            ("mode", "debug"),
            ("transport", "swd"),
        ],
        None,
    );
    let response = router(hub.clone())
        .oneshot(
            Request::post("/dispatch")
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_of(response).await["status"], "InvalidTransport");

    // Omitting the transport picks the declared default.
    let prepared = hub
        .validate(&DispatchRequest {
            target: "ch32v203".into(),
            probe: 3,
            mode: Mode::Debug,
            transport: None,
        })
        .unwrap();
    assert_eq!(prepared.transport, Some(Transport::Sdi));
}

#[tokio::test]
async fn flash_to_disconnected_probe_stages_nothing() {
    let locks = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let hub = hub(vec![], locks.path(), staging.path());

    let (content_type, body) = multipart(
        &[("target", "ch32v203"), ("probe", "3"), ("mode", "flash")],
        Some(("fw.bin", b"\x00\x01\x02\x03")),
    );
    let response = router(hub)
        .oneshot(
            Request::post("/dispatch")
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    // Validation runs before the upload is accepted.
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_of(response).await["status"], "ProbeNotConnected");
    assert!(staging_is_empty(staging.path()));
}

#[tokio::test]
async fn busy_probe_flash_cleans_staged_firmware() {
    let locks = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let hub = hub(vec![wch_link()], locks.path(), staging.path());

    // Someone else holds probe 3.
    let held = probe_hub::lock::try_acquire(locks.path(), 3).unwrap();

    let (content_type, body) = multipart(
        &[("target", "ch32v203"), ("probe", "3"), ("mode", "flash")],
        Some(("fw.bin", b"firmware-bytes")),
    );
    let response = router(hub)
        .oneshot(
            Request::post("/dispatch")
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_of(response).await["status"], "ProbeBusy");
    // The upload made it into staging and was cleaned up on refusal.
    assert!(staging_is_empty(staging.path()));
    drop(held);
}

#[tokio::test]
async fn firmware_in_debug_mode_is_rejected() {
    let locks = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let hub = hub(vec![wch_link()], locks.path(), staging.path());

    let (content_type, body) = multipart(
        &[("target", "ch32v203"), ("probe", "3"), ("mode", "debug")],
        Some(("fw.bin", b"firmware-bytes")),
    );
    let response = router(hub)
        .oneshot(
            Request::post("/dispatch")
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(staging_is_empty(staging.path()));
}

#[tokio::test]
async fn search_hex_case_does_not_affect_matching() {
    let locks = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let hub = hub(vec![wch_link()], locks.path(), staging.path());

    for query in ["vid=1a86", "vid=1A86", "vid=0x1A86", "pid=0X8010"] {
        let response = router(hub.clone())
            .oneshot(
                Request::get(format!("/probes/search?{query}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_of(response).await["count"], 1, "query {query}");
    }
}

#[tokio::test]
async fn session_stop_is_idempotent_on_idle_probes() {
    let locks = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let hub = hub(vec![wch_link()], locks.path(), staging.path());

    for _ in 0..2 {
        let response = router(hub.clone())
            .oneshot(
                Request::post("/session/stop")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("probe=3"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_of(response).await["status"], "no_session");
    }
}
