//! Polling helpers for outcomes produced by background reactions.
//!
//! Routing, negotiation and reaping all happen in spawned tasks reacting to
//! store changes, so tests wait for the outcome rather than for a call.

use call_client::ConnectionSnapshot;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

/// How long an outcome may take to settle.
#[derive(Debug, Clone, Copy)]
pub enum Settle {
    /// Router reactions and the negotiation round trips that follow.
    Negotiation,
    /// Lock preemption plus a reap pass.
    Reaper,
}

impl Settle {
    pub fn timeout(self) -> Duration {
        match self {
            Settle::Negotiation => Duration::from_secs(5),
            Settle::Reaper => Duration::from_secs(15),
        }
    }

    fn initial_delay(self) -> Duration {
        Duration::from_millis(5)
    }

    fn max_delay(self) -> Duration {
        Duration::from_millis(250)
    }
}

/// Wait until `condition` holds, polling with exponential backoff.
///
/// # Errors
///
/// Returns a message with the attempt count when the timeout passes first.
pub async fn assert_eventually<F, Fut>(settle: Settle, mut condition: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + settle.timeout();
    let mut delay = settle.initial_delay();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if condition().await {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(format!(
                "condition did not hold within {:?} ({attempts} attempts)",
                settle.timeout()
            ));
        }
        sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(settle.max_delay());
    }
}

/// Wait until a connection publishes a snapshot matching `predicate`.
///
/// # Errors
///
/// Returns the last snapshot seen when the timeout passes first.
pub async fn snapshot_eventually(
    snapshot: &mut watch::Receiver<ConnectionSnapshot>,
    settle: Settle,
    predicate: impl FnMut(&ConnectionSnapshot) -> bool,
) -> Result<ConnectionSnapshot, String> {
    let waited = timeout(settle.timeout(), async {
        snapshot.wait_for(predicate).await.map(|matched| matched.clone())
    })
    .await;
    match waited {
        Ok(Ok(matched)) => Ok(matched),
        Ok(Err(_)) => Err("connection dropped its snapshot".to_string()),
        Err(_) => Err(format!(
            "snapshot did not match within {:?}, last: {:?}",
            settle.timeout(),
            *snapshot.borrow()
        )),
    }
}
