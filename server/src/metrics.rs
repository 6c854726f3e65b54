use once_cell::sync::Lazy;
use prometheus::{
    HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder, register_histogram_vec,
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
};

pub static LOBBY_WAIT_TIME: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "lobby_wait_seconds",
        "Time spent waiting for lobby to fill",
        &["mode"],
        vec![5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("register lobby_wait_seconds")
});

pub static LOBBY_STATUS_CHANGES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lobby_status_changes_total",
        "Total lobby status changes",
        &["status"]
    )
    .expect("register lobby_status_changes_total")
});

pub static MODE_LOBBIES_COUNT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "mode_lobbies_active",
        "Active lobbies count per mode",
        &["mode"]
    )
    .expect("register mode_lobbies_active")
});

pub static LOBBY_PLAYERS_COUNT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "lobby_players_current",
        "Current number of players in lobby",
        &["lobby_id", "mode"]
    )
    .expect("register lobby_players_current")
});

pub static ACTIVE_STREAMS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("grpc_streams_active", "Current active gRPC streams")
        .expect("register grpc_streams_active")
});

/// Renders the default registry in the Prometheus text format.
pub fn render() -> String {
    let families = prometheus::gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .unwrap_or_default()
}
