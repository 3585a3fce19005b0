#![allow(dead_code)]

use std::time::Duration;

use tether::transport::memory;
use tether::{Connection, ExposeConfig, Exposed, Transport, Value, expose};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Handles move across the transport.
    Native,
    /// Everything is serialized to JSON text.
    Json,
}

pub const MODES: [Mode; 2] = [Mode::Native, Mode::Json];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn transports(mode: Mode) -> (Transport, Transport) {
    match mode {
        Mode::Native => memory::pair(),
        Mode::Json => memory::json_pair(),
    }
}

/// Expose `left` and `right` on either end of a fresh transport pair.
///
/// The first result belongs to the side that exposed `left`, so its
/// `remote` is `right`.
pub async fn connect(left: Value, right: Value, mode: Mode) -> (Exposed, Exposed) {
    let (a, b) = transports(mode);
    connect_over(left, right, a, b).await
}

pub async fn connect_over(left: Value, right: Value, a: Transport, b: Transport) -> (Exposed, Exposed) {
    init_tracing();
    let (left, right) = tokio::join!(
        expose(left, a, ExposeConfig::default()),
        expose(right, b, ExposeConfig::default()),
    );
    (
        left.expect("left side failed to connect"),
        right.expect("right side failed to connect"),
    )
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait until neither side holds channels or handles.
pub async fn settled(left: &Connection, right: &Connection) {
    eventually("channels to be released", || {
        left.live_channels() == 0
            && right.live_channels() == 0
            && left.outstanding_handles() == 0
            && right.outstanding_handles() == 0
    })
    .await;
}
