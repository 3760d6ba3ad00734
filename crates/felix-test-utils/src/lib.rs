// felix-test-utils: A mock master and raw peers for integration testing.
//
// Each test spins up its own isolated `MockMaster` on a random port and
// points the client runtime at it via `FEL_MASTER_ADDR`/`FEL_MASTER_PORT`.
// Raw peers speak the wire protocol directly, which lets tests pause
// reads, inject corrupt frames, and observe exact bytes.

mod mock_master;
mod raw_peers;

pub use mock_master::MockMaster;
pub use raw_peers::{RawSubscriber, RawTopicEndpoint};

/// Point the runtime's environment at a mock master.  Call before the
/// first `MasterProxy::instance()` in the test process.
pub fn set_master_env(addr: std::net::SocketAddr) {
    std::env::set_var("FEL_MASTER_ADDR", addr.ip().to_string());
    std::env::set_var("FEL_MASTER_PORT", addr.port().to_string());
}

/// Install a test subscriber honoring `RUST_LOG`.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
