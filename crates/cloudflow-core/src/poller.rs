//! Eventual-consistency wait primitive.
//!
//! Cloud providers acknowledge provisioning requests long before the
//! resource reaches a usable state ("address still RESERVING"). Handlers
//! absorb that by polling the vendor until a predicate holds. The wait
//! blocks only the calling worker task, never a scheduler pass.

use crate::EngineError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Repeatedly fetch the state of `keys` with `poll_fn` until `done_fn`
/// accepts the whole batch or `timeout` elapses.
///
/// `poll_fn` errors propagate immediately; a timeout surfaces as
/// [`EngineError::PollTimeout`], which the caller treats like any other
/// handler failure (so the task's retry policy applies). On success the
/// final batch of states is returned.
pub async fn poll_until_done<K, S, PF, Fut, DF>(
    keys: &[K],
    mut poll_fn: PF,
    done_fn: DF,
    interval: Duration,
    timeout: Duration,
) -> Result<Vec<S>, EngineError>
where
    PF: FnMut(&[K]) -> Fut,
    Fut: Future<Output = Result<Vec<S>, EngineError>>,
    DF: Fn(&[S]) -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut polls: u32 = 0;

    loop {
        let states = poll_fn(keys).await?;
        polls += 1;
        if done_fn(&states) {
            trace!(polls, "poll_until_done finished");
            return Ok(states);
        }

        if Instant::now() + interval > deadline {
            return Err(EngineError::PollTimeout(format!(
                "{} keys not done after {} polls within {:?}",
                keys.len(),
                polls,
                timeout
            )));
        }
        tokio::time::sleep(interval).await;
    }
}
