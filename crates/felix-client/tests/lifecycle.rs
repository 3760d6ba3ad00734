//! Runtime lifecycle: heart-beat cadence, idempotent stop, and
//! cancellation of work queued after stop.

use felix_client::{MasterProxy, ProxyState, StatusCode};
use felix_test_utils::{init_test_logging, set_master_env, MockMaster};
use std::time::Duration;

const HEART_BEAT: Duration = Duration::from_millis(100);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn heartbeats_flow_then_stop_is_idempotent() {
    init_test_logging();
    let master = MockMaster::start().await.expect("mock master");
    set_master_env(master.addr());

    let proxy = MasterProxy::instance();
    proxy.set_heart_beat_duration(HEART_BEAT);
    let status = tokio::task::spawn_blocking(|| MasterProxy::instance().start())
        .await
        .unwrap();
    assert!(status.is_ok(), "start failed: {status}");
    assert_eq!(proxy.state(), ProxyState::Running);
    assert!(proxy.client_info().is_valid());
    assert_eq!(master.registered_client_count(), 1);

    // Starting twice is refused without disturbing the running proxy.
    let again = tokio::task::spawn_blocking(|| MasterProxy::instance().start())
        .await
        .unwrap();
    assert_eq!(again.code, StatusCode::AlreadyExists);
    assert_eq!(proxy.state(), ProxyState::Running);

    // Observe pulses for a dozen declared periods.
    tokio::time::sleep(HEART_BEAT * 12).await;
    let pulses = master.heartbeats();
    assert!(pulses.len() >= 5, "only {} pulses arrived", pulses.len());

    // Sequence numbers increase by one per pulse.
    for window in pulses.windows(2) {
        assert_eq!(window[1].1.seq, window[0].1.seq + 1);
        assert_eq!(window[1].1.client_id, proxy.client_info().id);
    }

    // Observed cadence tracks the declared duration.  Individual gaps
    // jitter under load, so judge the mean.
    let intervals: Vec<Duration> = pulses
        .windows(2)
        .map(|window| window[1].0.duration_since(window[0].0))
        .collect();
    let mean = intervals.iter().sum::<Duration>() / intervals.len() as u32;
    assert!(
        mean >= HEART_BEAT.mul_f32(0.8) && mean <= HEART_BEAT.mul_f32(1.4),
        "mean inter-pulse interval {mean:?} strays from {HEART_BEAT:?}"
    );

    // Orderly stop; repeated stops are no-ops returning OK.
    let stop = tokio::task::spawn_blocking(|| MasterProxy::instance().stop())
        .await
        .unwrap();
    assert!(stop.is_ok());
    assert_eq!(proxy.state(), ProxyState::Stopped);
    for _ in 0..3 {
        let again = proxy.stop();
        assert!(again.is_ok(), "stop must stay idempotent");
    }
    assert_eq!(proxy.state(), ProxyState::Stopped);

    // Work submitted after stop resolves with CANCELLED.
    let (tx, rx) = std::sync::mpsc::channel();
    proxy.list_topics_async(Box::new(move |result| {
        tx.send(result).unwrap();
    }));
    let result = rx.recv_timeout(Duration::from_secs(2)).expect("cancel arm fired");
    assert_eq!(result.unwrap_err().code, StatusCode::Cancelled);

    // The task queue is gone; plain posts are refused.
    assert!(!proxy.post_task(|| {}));
}
