//! `/devman` REST control surface.
//!
//! Thin adapters over [`DeviceManager`]: parameter parsing and JSON envelope
//! assembly live here, every decision lives in the core. Two endpoints:
//!
//! - `GET /devman/offlinebuf` - offline-buffer stats and control. Actions:
//!   `status` (default), `start`/`resume`, `stop`/`pause`, `reset`/`clear`,
//!   `peek`, `fetch`. Filters: `bus`, `addr` (CSV, hex or decimal), `type`
//!   (CSV of type names). Windowing: `start`, `count`, `maxBytes`. Extras:
//!   `rateMs` (poll-rate override on start), `clear` (wipe on stop),
//!   `nonDestructive` (fetch consumes when 0), `simulate` (allocation
//!   estimate only).
//! - `GET /devman/typeinfo` - device type information by name or index.
//! - `GET /devman/debug` - compact per-device state summary.
//!
//! Responses are always HTTP 200 with a `rslt` field (`ok`/`fail...`),
//! matching what gateway tooling expects from the firmware's API.

use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use devman_bus::manager::TargetSet;
use devman_bus::{ControlSnapshot, DeviceManager, DeviceState};
use devman_core::Addr;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

/// Build the `/devman` router.
pub fn router(manager: Arc<DeviceManager>) -> Router {
    Router::new()
        .route("/devman/offlinebuf", get(offlinebuf))
        .route("/devman/typeinfo", get(typeinfo))
        .route("/devman/debug", get(debug_json))
        .with_state(manager)
}

fn ok_result(mut extra: Map<String, Value>) -> Json<Value> {
    let mut body = Map::new();
    body.insert("rslt".into(), Value::String("ok".into()));
    body.append(&mut extra);
    Json(Value::Object(body))
}

fn error_result(code: &str) -> Json<Value> {
    Json(json!({ "rslt": "fail", "error": code }))
}

/// Parse a flag parameter the way gateway tooling sends them: `1`/`0`,
/// `true`/`false`, case-insensitive.
fn flag(value: &Option<String>, default: bool) -> bool {
    match value.as_deref() {
        None => default,
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => true,
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => false,
        Some(_) => default,
    }
}

/// Split a CSV parameter, tolerating URL-encoded commas that survived
/// decoding (doubly-encoded clients exist).
fn csv(value: &str) -> Vec<String> {
    value
        .replace("%2C", ",")
        .replace("%2c", ",")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn addr_key(addr: Addr) -> String {
    format!("0x{:x}", addr.0)
}

fn addr_set_json(addrs: &std::collections::BTreeSet<Addr>) -> Value {
    Value::Array(addrs.iter().map(|a| Value::String(addr_key(*a))).collect())
}

// =============================================================================
// offlinebuf
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OfflineBufParams {
    bus: String,
    addr: String,
    #[serde(rename = "type")]
    type_csv: String,
    action: Option<String>,
    #[serde(rename = "rateMs")]
    rate_ms: i64,
    start: i64,
    count: i64,
    #[serde(rename = "maxBytes")]
    max_bytes: i64,
    clear: Option<String>,
    #[serde(rename = "nonDestructive")]
    non_destructive: Option<String>,
    simulate: Option<String>,
}

async fn offlinebuf(
    State(manager): State<Arc<DeviceManager>>,
    Query(params): Query<OfflineBufParams>,
) -> Json<Value> {
    let action = params.action.as_deref().unwrap_or("status");
    let addrs: Vec<Addr> = csv(&params.addr)
        .iter()
        .filter_map(|s| Addr::parse(s))
        .collect();
    let type_names = csv(&params.type_csv);
    let rate_ms = params.rate_ms.max(0) as u32;
    let start_idx = params.start.max(0) as u32;
    let max_responses = params.count.max(0) as u32;
    let max_bytes = params.max_bytes.max(0) as u32;
    let clear_on_stop = flag(&params.clear, false);
    let non_destructive = flag(&params.non_destructive, true);
    let simulate_only = flag(&params.simulate, false);

    let do_start = action.eq_ignore_ascii_case("start") || action.eq_ignore_ascii_case("resume");
    let do_stop = action.eq_ignore_ascii_case("stop") || action.eq_ignore_ascii_case("pause");
    let do_reset = action.eq_ignore_ascii_case("reset") || action.eq_ignore_ascii_case("clear");
    let is_fetch = action.eq_ignore_ascii_case("fetch");
    let do_peek = action.eq_ignore_ascii_case("peek") || (is_fetch && non_destructive);
    let do_drain = is_fetch && !non_destructive;

    info!(
        action,
        bus = %params.bus,
        addr = %params.addr,
        r#type = %params.type_csv,
        rate_ms,
        start_idx,
        max_responses,
        max_bytes,
        "offlinebuf request"
    );

    let (sets, bus_matched) = manager.resolve_targets(&params.bus, &addrs, &type_names);
    if !params.bus.is_empty() && !bus_matched {
        return error_result("failBusNotFound");
    }

    let mut stats = Map::new();
    let mut control = Map::new();
    let mut peek = Map::new();
    let mut estimate = Map::new();
    let mut peek_remaining_total = 0u64;
    let mut offline_bytes_total = 0u64;

    for set in &sets {
        if simulate_only {
            estimate.insert(set.bus.clone(), estimate_json(manager.as_ref(), set));
        } else if do_start {
            manager.start_capture(set, &type_names, rate_ms);
        }
        if do_stop {
            manager.stop_capture(set, clear_on_stop);
        }
        if do_reset && !do_stop {
            manager.reset_buffers(set);
        }

        let snapshot = manager.drain_controller().snapshot();
        stats.insert(
            set.bus.clone(),
            stats_json(set, &snapshot, &mut offline_bytes_total),
        );
        control.insert(set.bus.clone(), control_json(&snapshot));

        if do_peek || do_drain {
            let (bus_peek, remaining) =
                peek_json(set, start_idx, max_responses, max_bytes, do_drain);
            if !bus_peek.is_empty() {
                peek.insert(set.bus.clone(), Value::Object(bus_peek));
            }
            peek_remaining_total += remaining;
        }
    }

    let mut extra = Map::new();
    extra.insert("stats".into(), Value::Object(stats));
    if !control.is_empty() {
        extra.insert("control".into(), Value::Object(control));
    }
    if !peek.is_empty() {
        extra.insert("peek".into(), Value::Object(peek));
    }
    if !estimate.is_empty() {
        extra.insert("estimate".into(), Value::Object(estimate));
    }
    if peek_remaining_total > 0 {
        extra.insert("peekRemaining".into(), json!(peek_remaining_total));
    }
    extra.insert(
        "mem".into(),
        json!({ "offlineBytesInUse": offline_bytes_total }),
    );
    ok_result(extra)
}

/// Per-address buffer stats for one bus.
fn stats_json(set: &TargetSet, snapshot: &ControlSnapshot, offline_bytes_total: &mut u64) -> Value {
    let mut bus = Map::new();
    for device in &set.targets {
        let stats = device.offline_stats();
        if stats.max_entries == 0 {
            continue;
        }
        *offline_bytes_total +=
            stats.max_entries as u64 * (stats.payload_size + stats.meta_size) as u64;
        let addr = device.addr();
        let buf_paused =
            snapshot.global_buffer_paused || snapshot.buffer_paused.contains(&addr);
        let mut drain_paused =
            snapshot.global_drain_paused || snapshot.drain_paused.contains(&addr);
        if snapshot.drain_only_selected
            && !(snapshot.selected_addrs.contains(&addr)
                || snapshot.selected_types.contains(device.type_name()))
        {
            drain_paused = true;
        }
        bus.insert(
            addr_key(addr),
            json!({
                "depth": stats.depth,
                "drops": stats.drops,
                "max": stats.max_entries,
                "bytes": stats.bytes_in_use(),
                "wraps": stats.wrap_count,
                "oldestMs": stats.oldest_capture_ms,
                "bufPaused": u8::from(buf_paused),
                "drainPaused": u8::from(drain_paused),
                "payload": stats.payload_size,
                "meta": stats.meta_size,
            }),
        );
    }
    Value::Object(bus)
}

/// Control state snapshot for one bus.
fn control_json(snapshot: &ControlSnapshot) -> Value {
    let mut ctrl = Map::new();
    ctrl.insert(
        "bufferPausedGlobal".into(),
        json!(u8::from(snapshot.global_buffer_paused)),
    );
    ctrl.insert(
        "drainPausedGlobal".into(),
        json!(u8::from(snapshot.global_drain_paused)),
    );
    ctrl.insert("bufferPaused".into(), addr_set_json(&snapshot.buffer_paused));
    ctrl.insert("drainPaused".into(), addr_set_json(&snapshot.drain_paused));
    ctrl.insert(
        "selectedAddrs".into(),
        addr_set_json(&snapshot.selected_addrs),
    );
    ctrl.insert(
        "selectedTypes".into(),
        Value::Array(
            snapshot
                .selected_types
                .iter()
                .map(|t| Value::String(t.clone()))
                .collect(),
        ),
    );
    if snapshot.max_per_publish_override > 0 {
        ctrl.insert(
            "maxPerPublishOverride".into(),
            json!(snapshot.max_per_publish_override),
        );
    }
    if !snapshot.rate_overrides_us.is_empty() {
        let overrides: Map<String, Value> = snapshot
            .rate_overrides_us
            .iter()
            .map(|(addr, us)| (addr_key(*addr), json!(us / 1000)))
            .collect();
        ctrl.insert("rateOverrides".into(), Value::Object(overrides));
    }
    Value::Object(ctrl)
}

/// Buffered-sample window for one bus. With `consume` the window is drained
/// (destructive fetch) instead of peeked.
fn peek_json(
    set: &TargetSet,
    start_idx: u32,
    max_responses: u32,
    max_bytes: u32,
    consume: bool,
) -> (Map<String, Value>, u64) {
    let mut bus = Map::new();
    let mut remaining_total = 0u64;
    for device in &set.targets {
        let (payloads, metas) = if consume {
            device.drain(max_responses, max_bytes)
        } else {
            device.peek_offline(start_idx, max_responses, max_bytes)
        };
        remaining_total += remaining_after_window(device, start_idx, metas.len() as u32, consume);
        if metas.is_empty() {
            continue;
        }
        let payload_size = device.buffer_spec().payload_size as usize;
        let entries: Vec<Value> = metas
            .iter()
            .enumerate()
            .map(|(i, meta)| {
                let at = i * payload_size;
                json!({
                    "seq": meta.seq,
                    "ts": meta.ts,
                    "tsBaseMs": meta.ts_base_ms,
                    "hex": hex::encode(&payloads[at..at + payload_size]),
                })
            })
            .collect();
        bus.insert(addr_key(device.addr()), Value::Array(entries));
    }
    (bus, remaining_total)
}

fn remaining_after_window(
    device: &Arc<DeviceState>,
    start_idx: u32,
    returned: u32,
    consumed: bool,
) -> u64 {
    let depth = device.offline_stats().depth;
    if consumed {
        depth as u64
    } else {
        depth.saturating_sub(start_idx + returned) as u64
    }
}

/// Per-address allocation estimates for one bus (simulate mode).
fn estimate_json(manager: &DeviceManager, set: &TargetSet) -> Value {
    let estimates = manager.drain_controller().estimate_allocations(&set.targets);
    let mut bus = Map::new();
    for (addr, est) in estimates {
        bus.insert(
            addr_key(addr),
            json!({
                "bytes": est.alloc_bytes,
                "bpe": est.bytes_per_entry,
                "payload": est.payload_size,
                "meta": est.meta_size,
            }),
        );
    }
    Value::Object(bus)
}

// =============================================================================
// typeinfo
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TypeInfoParams {
    bus: String,
    #[serde(rename = "type")]
    type_name: String,
}

async fn typeinfo(
    State(manager): State<Arc<DeviceManager>>,
    Query(params): Query<TypeInfoParams>,
) -> Json<Value> {
    if params.bus.is_empty() {
        return error_result("failBusMissing");
    }
    if params.type_name.is_empty() {
        return error_result("failTypeMissing");
    }
    match manager.type_info_json(&params.type_name) {
        Some(info) if !info.is_empty() && info != "{}" => {
            let devinfo: Value =
                serde_json::from_str(&info).unwrap_or(Value::String(info));
            let mut extra = Map::new();
            extra.insert("devinfo".into(), devinfo);
            ok_result(extra)
        }
        _ => error_result("failTypeNotFound"),
    }
}

// =============================================================================
// debug
// =============================================================================

/// Compact per-bus/per-device state summary for diagnostics.
async fn debug_json(State(manager): State<Arc<DeviceManager>>) -> Json<Value> {
    let mut buses = Map::new();
    for bus in manager.buses() {
        let mut devices = Map::new();
        for device in manager.registry().snapshot_bus(bus.bus_name()) {
            let stats = device.offline_stats();
            let status: Value =
                serde_json::from_str(&device.status_json()).unwrap_or(Value::Null);
            devices.insert(
                addr_key(device.addr()),
                json!({
                    "type": device.type_name(),
                    "status": status,
                    "seq": device.offline_seq(),
                    "depth": stats.depth,
                    "drops": stats.drops,
                    "lastDataMs": device.last_data_time_ms(),
                }),
            );
        }
        buses.insert(bus.bus_name().to_string(), Value::Object(devices));
    }
    let mut extra = Map::new();
    extra.insert("devices".into(), Value::Object(buses));
    ok_result(extra)
}
