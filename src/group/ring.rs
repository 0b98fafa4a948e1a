//! Ring-group hunting.
//!
//! `RingGroup::ring` dials a set of destinations and returns the first
//! channel that actually comes up — EXECUTE state plus a `CHANNEL_ANSWER`,
//! per [`Channel::wait_for_state`] — or `None` when nobody answers within
//! the timeout.  Losing legs are hung up best-effort; cleanup failures
//! are swallowed.

use crate::channel::Channel;
use crate::error::EslError;
use crate::group::balancer::{InMemoryBalancer, LoadBalancerBackend};
use crate::protocol::EslConnection;
use esl_wire::{ChannelState, VarMap};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How the group is hunted.
pub enum RingMode<'a, B: LoadBalancerBackend = InMemoryBalancer> {
    /// Dial everyone at once; first to come up wins.
    Parallel,
    /// Dial one at a time in list order.
    Sequential,
    /// Dial one at a time, least-loaded first, tracked in the backend.
    Balanced(&'a B),
}

/// Multi-destination dialing strategies.
pub struct RingGroup;

impl RingGroup {
    /// Ring `group` and return the first channel to come up, or `None`
    /// on timeout.
    pub async fn ring<B: LoadBalancerBackend>(
        conn: &EslConnection,
        group: &[String],
        mode: RingMode<'_, B>,
        timeout: Duration,
        variables: Option<&VarMap>,
    ) -> Result<Option<Channel>, EslError> {
        match mode {
            RingMode::Parallel => Self::ring_parallel(conn, group, timeout, variables).await,
            RingMode::Sequential => Self::ring_sequential(conn, group, timeout, variables).await,
            RingMode::Balanced(balancer) => {
                Self::ring_balanced(conn, group, timeout, variables, balancer).await
            }
        }
    }

    // -- parallel ------------------------------------------------------------

    async fn ring_parallel(
        conn: &EslConnection,
        group: &[String],
        timeout: Duration,
        variables: Option<&VarMap>,
    ) -> Result<Option<Channel>, EslError> {
        let mut callees: Vec<Channel> = Vec::with_capacity(group.len());
        for destination in group {
            callees.push(Channel::create(conn, destination, variables).await?);
        }

        // Individual waits get twice the global timeout so the race below,
        // not the per-leg wait, decides who gives up.
        let mut waits: JoinSet<(usize, Result<Option<esl_wire::EslEvent>, EslError>)> =
            JoinSet::new();
        for (idx, channel) in callees.iter().enumerate() {
            let channel = channel.clone();
            waits.spawn(async move {
                (
                    idx,
                    channel.wait_for_state(ChannelState::Execute, timeout * 2).await,
                )
            });
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut winner: Option<Channel> = None;
        loop {
            let joined = tokio::select! {
                joined = waits.join_next() => joined,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("ring group timed out");
                    break;
                }
            };
            match joined {
                None => break,
                Some(Ok((idx, Ok(Some(_event))))) => {
                    winner = Some(callees[idx].clone());
                    break;
                }
                Some(Ok((idx, outcome))) => {
                    debug!(
                        destination = %group[idx],
                        outcome = ?outcome.err(),
                        "callee did not come up"
                    );
                }
                Some(Err(_)) => {}
            }
        }

        waits.abort_all();
        Self::cleanup_unanswered(&callees, winner.as_ref()).await;

        if let Some(channel) = &winner {
            info!(uuid = ?channel.uuid(), "ring group answered");
        }
        Ok(winner)
    }

    // -- sequential ----------------------------------------------------------

    async fn ring_sequential(
        conn: &EslConnection,
        group: &[String],
        timeout: Duration,
        variables: Option<&VarMap>,
    ) -> Result<Option<Channel>, EslError> {
        for destination in group {
            let channel = Channel::create(conn, destination, variables).await?;
            match channel.wait_for_state(ChannelState::Execute, timeout).await {
                Ok(Some(_)) => return Ok(Some(channel)),
                Ok(None) => {
                    debug!(destination = %destination, "callee went terminal, advancing");
                }
                Err(EslError::Timeout(_)) => {
                    Self::hangup_best_effort(&channel).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    // -- balanced ------------------------------------------------------------

    async fn ring_balanced<B: LoadBalancerBackend>(
        conn: &EslConnection,
        group: &[String],
        timeout: Duration,
        variables: Option<&VarMap>,
        balancer: &B,
    ) -> Result<Option<Channel>, EslError> {
        let mut remaining: Vec<String> = group.to_vec();
        while !remaining.is_empty() {
            let chosen = balancer
                .get_least_loaded(&remaining)
                .await?
                .unwrap_or_else(|| remaining[0].clone());
            balancer.increment(&chosen).await?;

            let channel = Channel::create(conn, &chosen, variables).await?;
            match channel.wait_for_state(ChannelState::Execute, timeout).await {
                Ok(Some(_)) => {
                    balancer.decrement(&chosen).await?;
                    return Ok(Some(channel));
                }
                Ok(None) | Err(EslError::Timeout(_)) => {
                    balancer.decrement(&chosen).await?;
                    Self::hangup_best_effort(&channel).await;
                    remaining.retain(|d| d != &chosen);
                }
                Err(e) => {
                    balancer.decrement(&chosen).await?;
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    // -- cleanup -------------------------------------------------------------

    async fn cleanup_unanswered(callees: &[Channel], winner: Option<&Channel>) {
        for channel in callees {
            if let Some(winner) = winner {
                if winner.uuid() == channel.uuid() {
                    continue;
                }
            }
            if channel.state() >= ChannelState::Hangup {
                continue;
            }
            Self::hangup_best_effort(channel).await;
        }
    }

    async fn hangup_best_effort(channel: &Channel) {
        if let Err(e) = channel.hangup("NORMAL_CLEARING").await {
            warn!(uuid = ?channel.uuid(), error = %e, "cleanup hangup failed");
        }
    }
}
