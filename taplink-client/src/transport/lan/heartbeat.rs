//! The heartbeat supervisor.
//!
//! The LAN transport owns a periodic application-framed keep-alive. Frames
//! use a reserved text prefix that can never be a valid JSON envelope, so
//! the reader can consume replies without delivering them to the
//! application receiver. Two consecutive failures declare the connection
//! dead; the socket goes down but service monitoring stays alive so the
//! terminal can be rediscovered.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::LanSettings;
use crate::metrics::{METRICS_ID_SDK_HEARTBEAT_RTT, METRICS_ID_SDK_HEARTBEAT_TIMEOUTS};
use crate::transport::lan::OutboundFrame;

/// Reserved text prefix of heartbeat frames. Replies echo the full body.
pub(crate) const HEARTBEAT_PREFIX: &str = "@taplink-hb/";

/// Returns the echoed sequence number iff `body` is a heartbeat frame.
pub(crate) fn parse_heartbeat(body: &str) -> Option<u64> {
    body.strip_prefix(HEARTBEAT_PREFIX)?.parse().ok()
}

/// Observes heartbeat outcomes.
pub(crate) trait HeartbeatObserver: Send + Sync {
    /// A reply arrived, but later than `delay_ratio × timeout`.
    fn on_delayed(&self, rtt: Duration) {
        let _ = rtt;
    }

    /// No reply arrived before the deadline.
    fn on_timeout(&self, consecutive_failures: u32) {
        let _ = consecutive_failures;
    }

    /// The heartbeat frame could not be written.
    fn on_failed(&self) {}

    /// The consecutive-failure threshold was reached.
    fn on_dead(&self);
}

/// Runs the heartbeat loop until cancelled or the connection dies.
///
/// `replies` carries the sequence numbers the reader extracted from echoed
/// heartbeat frames. Stale sequence numbers are skipped.
pub(crate) async fn heartbeat_task(
    settings: LanSettings,
    writer: mpsc::Sender<OutboundFrame>,
    mut replies: mpsc::Receiver<u64>,
    observer: std::sync::Arc<dyn HeartbeatObserver>,
    cancel: CancellationToken,
) {
    let delay_threshold = settings
        .heartbeat_timeout
        .mul_f64(settings.heartbeat_delay_ratio.clamp(0.0, 1.0));
    let mut interval = tokio::time::interval(settings.heartbeat_interval);
    // first tick triggers instantly
    let mut seq = 0u64;
    let mut consecutive_failures = 0u32;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        seq += 1;
        let sent_at = Instant::now();
        if writer
            .send(OutboundFrame::Heartbeat(format!("{HEARTBEAT_PREFIX}{seq}")))
            .await
            .is_err()
        {
            observer.on_failed();
            consecutive_failures += 1;
            if consecutive_failures >= settings.heartbeat_failure_threshold {
                observer.on_dead();
                break;
            }
            continue;
        }
        let reply = tokio::select! {
            _ = cancel.cancelled() => break,
            reply = await_reply(&mut replies, seq, settings.heartbeat_timeout) => reply,
        };
        match reply {
            ReplyOutcome::Received => {
                let rtt = sent_at.elapsed();
                ::metrics::histogram!(METRICS_ID_SDK_HEARTBEAT_RTT)
                    .record(rtt.as_secs_f64() * 1000.0);
                if rtt > delay_threshold {
                    tracing::debug!("heartbeat {seq} delayed, rtt {rtt:?}");
                    observer.on_delayed(rtt);
                }
                consecutive_failures = 0;
            }
            ReplyOutcome::ChannelClosed => break,
            ReplyOutcome::TimedOut => {
                consecutive_failures += 1;
                ::metrics::counter!(METRICS_ID_SDK_HEARTBEAT_TIMEOUTS).increment(1);
                tracing::warn!("heartbeat {seq} timed out ({consecutive_failures} consecutive)");
                observer.on_timeout(consecutive_failures);
                if consecutive_failures >= settings.heartbeat_failure_threshold {
                    observer.on_dead();
                    break;
                }
            }
        }
    }
}

enum ReplyOutcome {
    Received,
    TimedOut,
    ChannelClosed,
}

async fn await_reply(
    replies: &mut mpsc::Receiver<u64>,
    expected_seq: u64,
    timeout: Duration,
) -> ReplyOutcome {
    let wait = async {
        while let Some(seq) = replies.recv().await {
            if seq == expected_seq {
                return ReplyOutcome::Received;
            }
            tracing::trace!("skipping stale heartbeat reply {seq}");
        }
        ReplyOutcome::ChannelClosed
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(outcome) => outcome,
        Err(_) => ReplyOutcome::TimedOut,
    }
}
