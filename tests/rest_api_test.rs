//! REST control surface tests: the `/devman/offlinebuf` envelope and
//! actions, and `/devman/typeinfo`, exercised through the axum router.

mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use devman_bus::{DeviceManager, OfflineSettings};
use devman_core::Addr;
use http_body_util::BodyExt;
use rust_devman::StaticTypeRegistry;
use serde_json::Value;
use std::sync::Arc;
use support::{dist_sensor, MockBus, MockDevice};
use tower::util::ServiceExt;

async fn setup() -> (Arc<MockBus>, Arc<DeviceManager>, Router) {
    let bus = Arc::new(MockBus::new("I2CA"));
    bus.add_device(Addr(0x30), MockDevice::online(0));
    let types = Arc::new(StaticTypeRegistry::new(vec![dist_sensor(8, false)]));
    let manager = Arc::new(DeviceManager::new(types, OfflineSettings::default()));
    manager.add_bus(bus.clone());
    manager.tick(bus.now_us()).await;
    manager.tick(bus.now_us()).await;
    let router = devman_server::router(manager.clone());
    (bus, manager, router)
}

async fn get_json(router: &Router, uri: &str) -> Value {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn capture_samples(manager: &DeviceManager, bus: &MockBus, count: u32) {
    for _ in 0..count {
        bus.advance_us(100_000);
        manager.tick(bus.now_us()).await;
    }
}

#[tokio::test]
async fn test_status_envelope() {
    let (bus, manager, router) = setup().await;
    capture_samples(&manager, &bus, 2).await;

    let body = get_json(&router, "/devman/offlinebuf").await;
    assert_eq!(body["rslt"], "ok");
    let stats = &body["stats"]["I2CA"]["0x30"];
    assert_eq!(stats["depth"], 2);
    assert_eq!(stats["drops"], 0);
    assert_eq!(stats["max"], 8);
    assert_eq!(stats["payload"], 4);
    assert_eq!(stats["meta"], 4);
    assert_eq!(stats["bufPaused"], 0);
    assert_eq!(stats["drainPaused"], 0);
    let control = &body["control"]["I2CA"];
    assert_eq!(control["bufferPausedGlobal"], 0);
    assert_eq!(control["drainPausedGlobal"], 0);
    assert_eq!(body["mem"]["offlineBytesInUse"], 8 * (4 + 4));
}

#[tokio::test]
async fn test_unknown_bus_fails() {
    let (_bus, _manager, router) = setup().await;
    let body = get_json(&router, "/devman/offlinebuf?bus=SPIX").await;
    assert_eq!(body["rslt"], "fail");
    assert_eq!(body["error"], "failBusNotFound");
}

#[tokio::test]
async fn test_start_then_stop_round_trip() {
    let (bus, manager, router) = setup().await;

    let body = get_json(
        &router,
        "/devman/offlinebuf?action=start&addr=0x30&rateMs=50",
    )
    .await;
    assert_eq!(body["rslt"], "ok");
    assert_eq!(body["control"]["I2CA"]["drainPausedGlobal"], 1);
    assert_eq!(body["control"]["I2CA"]["rateOverrides"]["0x30"], 50);
    assert_eq!(body["stats"]["I2CA"]["0x30"]["bufPaused"], 0);

    // 50 ms override rate: two samples in 100 ms.
    for _ in 0..2 {
        bus.advance_us(50_000);
        manager.tick(bus.now_us()).await;
    }
    let body = get_json(&router, "/devman/offlinebuf").await;
    assert_eq!(body["stats"]["I2CA"]["0x30"]["depth"], 2);

    let body = get_json(&router, "/devman/offlinebuf?action=stop&clear=1").await;
    assert_eq!(body["stats"]["I2CA"]["0x30"]["depth"], 0);
    assert_eq!(body["control"]["I2CA"]["bufferPausedGlobal"], 1);
    assert!(body["control"]["I2CA"].get("rateOverrides").is_none());
}

#[tokio::test]
async fn test_peek_window_and_remaining() {
    let (bus, manager, router) = setup().await;
    capture_samples(&manager, &bus, 5).await;

    let body = get_json(
        &router,
        "/devman/offlinebuf?action=peek&start=1&count=2",
    )
    .await;
    let entries = body["peek"]["I2CA"]["0x30"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["seq"], 1);
    assert_eq!(entries[1]["seq"], 2);
    assert_eq!(entries[0]["hex"].as_str().unwrap().len(), 8);
    assert_eq!(body["peekRemaining"], 2);

    // Peeking is non-destructive.
    let body = get_json(&router, "/devman/offlinebuf").await;
    assert_eq!(body["stats"]["I2CA"]["0x30"]["depth"], 5);
}

#[tokio::test]
async fn test_destructive_fetch_consumes() {
    let (bus, manager, router) = setup().await;
    capture_samples(&manager, &bus, 3).await;

    let body = get_json(
        &router,
        "/devman/offlinebuf?action=fetch&nonDestructive=0&count=2",
    )
    .await;
    let entries = body["peek"]["I2CA"]["0x30"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(body["stats"]["I2CA"]["0x30"]["depth"], 3, "stats snapshot precedes the drain");

    let body = get_json(&router, "/devman/offlinebuf").await;
    assert_eq!(body["stats"]["I2CA"]["0x30"]["depth"], 1);
}

#[tokio::test]
async fn test_simulate_estimates_without_side_effects() {
    let (bus, manager, router) = setup().await;
    capture_samples(&manager, &bus, 1).await;

    let body = get_json(&router, "/devman/offlinebuf?simulate=1").await;
    let est = &body["estimate"]["I2CA"]["0x30"];
    assert_eq!(est["bpe"], 8);
    assert_eq!(est["payload"], 4);
    assert_eq!(est["bytes"], 8 * 8);
    // Nothing paused, nothing cleared.
    assert_eq!(body["stats"]["I2CA"]["0x30"]["depth"], 1);
}

#[tokio::test]
async fn test_reset_clears_buffers() {
    let (bus, manager, router) = setup().await;
    capture_samples(&manager, &bus, 3).await;
    let body = get_json(&router, "/devman/offlinebuf?action=reset").await;
    assert_eq!(body["stats"]["I2CA"]["0x30"]["depth"], 0);
}

#[tokio::test]
async fn test_debug_summary() {
    let (bus, manager, router) = setup().await;
    capture_samples(&manager, &bus, 2).await;

    let body = get_json(&router, "/devman/debug").await;
    let dev = &body["devices"]["I2CA"]["0x30"];
    assert_eq!(dev["type"], "DIST4");
    assert_eq!(dev["depth"], 2);
    assert_eq!(dev["seq"], 2);
    assert_eq!(dev["status"]["s"], "OWN");
}

#[tokio::test]
async fn test_typeinfo_lookup() {
    let (_bus, _manager, router) = setup().await;

    let body = get_json(&router, "/devman/typeinfo?bus=I2CA&type=DIST4").await;
    assert_eq!(body["rslt"], "ok");
    assert_eq!(body["devinfo"]["fields"][0], "mm");

    let body = get_json(&router, "/devman/typeinfo?bus=I2CA&type=0").await;
    assert_eq!(body["rslt"], "ok");

    let body = get_json(&router, "/devman/typeinfo?bus=I2CA&type=NOPE").await;
    assert_eq!(body["error"], "failTypeNotFound");

    let body = get_json(&router, "/devman/typeinfo?bus=I2CA").await;
    assert_eq!(body["error"], "failTypeMissing");

    let body = get_json(&router, "/devman/typeinfo").await;
    assert_eq!(body["error"], "failBusMissing");
}
