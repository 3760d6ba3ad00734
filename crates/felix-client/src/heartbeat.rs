//! Heart-beat signaller.
//!
//! Binds a UDP endpoint that is advertised to the master in `ClientInfo`.
//! The master announces itself on that endpoint, after which the signaller
//! pulses `{client_id, seq, timestamp_ns}` at the declared interval.  Two
//! consecutive send failures mean the liveness contract cannot be kept and
//! the process aborts.

use crate::logging;
use felix_channel::udp::UdpChannelListener;
use felix_channel::ChannelConfig;
use felix_protocol::{ChannelKind, ChannelSource, ClientInfo, HeartBeat, Status};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct HeartBeatSignaller {
    source: ChannelSource,
}

impl HeartBeatSignaller {
    /// Bind the signaller endpoint and spawn the pulse loop.  Returns once
    /// the local port is known; the returned source goes into the
    /// `ClientInfo` sent to the master.
    ///
    /// Must be called on the proxy task runner.
    pub async fn start(
        client_info: Arc<StdMutex<ClientInfo>>,
        quit: watch::Receiver<bool>,
    ) -> Result<HeartBeatSignaller, Status> {
        let listener =
            UdpChannelListener::listen(&ChannelSource::pick_random(ChannelKind::Udp)).await?;
        let source = listener.channel_source();
        info!(source = %source, "heart-beat signaller listening");

        tokio::task::spawn_local(pulse_loop(listener, client_info, quit));

        Ok(HeartBeatSignaller { source })
    }

    pub fn channel_source(&self) -> &ChannelSource {
        &self.source
    }
}

async fn pulse_loop(
    listener: UdpChannelListener,
    client_info: Arc<StdMutex<ClientInfo>>,
    mut quit: watch::Receiver<bool>,
) {
    let config = ChannelConfig::default();

    // The master announces itself before pulses can flow anywhere.
    let peer = tokio::select! {
        accepted = listener.accept(&config) => match accepted {
            Ok(peer) => peer,
            Err(status) => {
                warn!(status = %status, "heart-beat endpoint died before the master attached");
                return;
            }
        },
        _ = quit.changed() => return,
    };
    debug!(peer = %peer.remote_addr(), "master attached to heart-beat signaller");

    let duration_ms = client_info
        .lock()
        .expect("client info poisoned")
        .heart_beat_duration_ms;
    let mut ticker = tokio::time::interval(Duration::from_millis(duration_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut seq: u32 = 0;
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let client_id = client_info
                    .lock()
                    .expect("client info poisoned")
                    .id;
                let pulse = HeartBeat {
                    client_id,
                    seq,
                    timestamp_ns: now_ns(),
                };
                match peer.send_message(&pulse.encode()).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        seq = seq.wrapping_add(1);
                    }
                    Err(status) => {
                        consecutive_failures += 1;
                        warn!(
                            status = %status,
                            failures = consecutive_failures,
                            "heart-beat pulse failed, master unavailable"
                        );
                        if consecutive_failures >= 2 {
                            logging::fatal("heart-beat signaller failed twice in a row");
                        }
                    }
                }
            }
            _ = quit.changed() => break,
        }
    }
    debug!("heart-beat signaller stopped");
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
