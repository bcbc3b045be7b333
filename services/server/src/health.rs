//! Per-connection ping/pong health checking.
//!
//! One monitor task per transport generation.  Each interval tick it checks
//! the missed-pong counter, terminates the transport at the limit (close
//! code 1000, reason "Ping timeout"), otherwise pings and re-checks after
//! the pong timeout.  A pong that races the check wins: the counter only
//! increments when no pong arrived after the latest ping.

use crate::config::HealthConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::PingError;
use crate::events::{EventBus, ServerEvent};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Deadline for [`ping`] round trips.
pub const MANUAL_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code used when a peer stops answering pings.
pub const PING_TIMEOUT_CLOSE_CODE: u16 = 1000;
pub const PING_TIMEOUT_REASON: &str = "Ping timeout";

/// Start (or restart) the monitor loop for a connection.
///
/// Any previous monitor for an older transport generation is aborted first.
pub async fn start(conn: &Arc<Connection>, config: &HealthConfig, bus: EventBus) {
    if !config.enabled {
        return;
    }
    let interval = config.interval;
    let timeout = config.timeout;
    let max_missed = config.max_missed;
    let weak = Arc::downgrade(conn);

    let monitor = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; pinging starts one interval in.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(conn) = weak.upgrade() else { break };
            if conn.state().await != ConnectionState::Open {
                break;
            }

            let missed = conn.health.lock().await.missed_pongs;
            if missed >= max_missed {
                info!(connection_id = %conn.id(), missed, "ping timeout, closing transport");
                let _ = bus.send(ServerEvent::PingTimeout {
                    connection: conn.clone(),
                });
                conn.close_transport(PING_TIMEOUT_CLOSE_CODE, PING_TIMEOUT_REASON)
                    .await;
                break;
            }

            conn.health.lock().await.last_ping_at = Some(Instant::now());
            if let Err(e) = conn.send_ping().await {
                debug!(connection_id = %conn.id(), error = %e, "ping not sent");
            }
            drop(conn);

            tokio::time::sleep(timeout).await;

            let Some(conn) = weak.upgrade() else { break };
            let mut health = conn.health.lock().await;
            let answered = match (health.last_pong_at, health.last_ping_at) {
                (Some(pong), Some(ping)) => pong >= ping,
                _ => false,
            };
            if !answered {
                health.missed_pongs += 1;
                let missed_pongs = health.missed_pongs;
                drop(health);
                debug!(connection_id = %conn.id(), missed_pongs, "pong missed");
                let _ = bus.send(ServerEvent::PingMissed {
                    connection: conn.clone(),
                    missed_pongs,
                });
            }
        }
    });

    let mut health = conn.health.lock().await;
    if let Some(previous) = health.monitor.replace(monitor) {
        previous.abort();
    }
}

/// Stop the monitor loop; idempotent, leaves the handle empty.
pub async fn stop(conn: &Arc<Connection>) {
    let mut health = conn.health.lock().await;
    if let Some(monitor) = health.monitor.take() {
        monitor.abort();
    }
}

/// Record an inbound pong: stamp, reset the counter, fulfil manual-ping
/// waiters, publish the observed latency.
pub async fn on_pong(conn: &Arc<Connection>, bus: &EventBus) {
    let now = Instant::now();
    let mut health = conn.health.lock().await;
    let latency = health
        .last_ping_at
        .map(|ping| now.duration_since(ping))
        .unwrap_or_default();
    health.last_pong_at = Some(now);
    health.missed_pongs = 0;
    let waiters = std::mem::take(&mut health.pong_waiters);
    drop(health);

    for waiter in waiters {
        let _ = waiter.send(latency);
    }
    let _ = bus.send(ServerEvent::PongReceived {
        connection: conn.clone(),
        latency,
    });
}

/// Measure one round trip: install a pong waiter, ping, await the pong.
pub async fn ping(conn: &Arc<Connection>) -> Result<Duration, PingError> {
    let (waiter, measured) = oneshot::channel();
    {
        let mut health = conn.health.lock().await;
        health.last_ping_at = Some(Instant::now());
        health.pong_waiters.push(waiter);
    }
    conn.send_ping().await?;

    match tokio::time::timeout(MANUAL_PING_TIMEOUT, measured).await {
        Ok(Ok(latency)) => Ok(latency),
        _ => Err(PingError::Timeout),
    }
}
