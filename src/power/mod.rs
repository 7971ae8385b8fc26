//! Display power arbitration.
//!
//! Independent watchers vote for standby; the display is off while any
//! vote asks for it. Transitions are published into the slideshow inbox.

pub mod ambient;
pub mod motion;
pub mod schedule;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::events::{PowerState, SlideshowEvent, VoteSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Vote {
    pub standby: bool,
    pub description: String,
}

#[derive(Debug, Default)]
struct Ballot {
    votes: BTreeMap<VoteSource, Vote>,
    standby: bool,
}

impl Ballot {
    fn evaluate(&mut self) -> Option<PowerState> {
        let standby = self.votes.values().any(|v| v.standby);
        if standby == self.standby {
            return None;
        }
        self.standby = standby;
        Some(if standby {
            PowerState::Standby
        } else {
            PowerState::Active
        })
    }
}

#[derive(Debug)]
pub struct PowerArbiter {
    ballot: Mutex<Ballot>,
    events: mpsc::Sender<SlideshowEvent>,
}

impl PowerArbiter {
    pub fn new(events: mpsc::Sender<SlideshowEvent>) -> Self {
        Self {
            ballot: Mutex::new(Ballot::default()),
            events,
        }
    }

    /// Records `source`'s vote and publishes a transition if the outcome
    /// changed. The ballot stays locked until the event is queued, so
    /// transitions reach the slideshow in order.
    pub async fn vote(
        &self,
        source: VoteSource,
        standby: bool,
        description: impl Into<String>,
    ) -> Result<Option<PowerState>> {
        let mut ballot = self.ballot.lock().await;
        let vote = Vote {
            standby,
            description: description.into(),
        };
        if ballot.votes.get(&source) != Some(&vote) {
            debug!(%source, standby, description = vote.description, "power vote");
        }
        ballot.votes.insert(source, vote);
        self.publish(&mut ballot).await
    }

    /// Drops `source` from the ballot, e.g. when its watcher is disabled.
    pub async fn withdraw(&self, source: VoteSource) -> Result<Option<PowerState>> {
        let mut ballot = self.ballot.lock().await;
        if ballot.votes.remove(&source).is_none() {
            return Ok(None);
        }
        debug!(%source, "power vote withdrawn");
        self.publish(&mut ballot).await
    }

    async fn publish(&self, ballot: &mut Ballot) -> Result<Option<PowerState>> {
        let Some(state) = ballot.evaluate() else {
            return Ok(None);
        };
        let voters: Vec<&str> = ballot
            .votes
            .iter()
            .filter(|(_, v)| v.standby)
            .map(|(s, _)| s.as_str())
            .collect();
        info!(%state, ?voters, "display power transition");
        self.events
            .send(SlideshowEvent::Power(state))
            .await
            .context("slideshow inbox closed")?;
        Ok(Some(state))
    }

    pub async fn is_standby(&self) -> bool {
        self.ballot.lock().await.standby
    }

    pub async fn votes(&self) -> BTreeMap<VoteSource, Vote> {
        self.ballot.lock().await.votes.clone()
    }

    /// Flips the manual vote and returns the new standby request.
    pub async fn toggle_manual(&self) -> Result<bool> {
        let mut ballot = self.ballot.lock().await;
        let standby = !ballot
            .votes
            .get(&VoteSource::Manual)
            .is_some_and(|v| v.standby);
        debug!(standby, "manual power toggle");
        ballot.votes.insert(
            VoteSource::Manual,
            Vote {
                standby,
                description: "manual toggle".to_string(),
            },
        );
        self.publish(&mut ballot).await?;
        Ok(standby)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn any_standby_vote_wins() {
        let (tx, mut rx) = mpsc::channel(8);
        let arbiter = PowerArbiter::new(tx);
        assert_eq!(arbiter.vote(VoteSource::Schedule, false, "day").await.unwrap(), None);
        assert_eq!(
            arbiter.vote(VoteSource::Ambient, true, "dark").await.unwrap(),
            Some(PowerState::Standby)
        );
        assert_eq!(arbiter.vote(VoteSource::Schedule, true, "night").await.unwrap(), None);
        assert_eq!(arbiter.vote(VoteSource::Ambient, false, "light").await.unwrap(), None);
        assert!(arbiter.is_standby().await);
        assert_eq!(
            arbiter.withdraw(VoteSource::Schedule).await.unwrap(),
            Some(PowerState::Active)
        );

        assert_eq!(rx.recv().await, Some(SlideshowEvent::Power(PowerState::Standby)));
        assert_eq!(rx.recv().await, Some(SlideshowEvent::Power(PowerState::Active)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn manual_toggle_flips() {
        let (tx, _rx) = mpsc::channel(8);
        let arbiter = PowerArbiter::new(tx);
        assert!(arbiter.toggle_manual().await.unwrap());
        assert!(arbiter.is_standby().await);
        assert!(!arbiter.toggle_manual().await.unwrap());
        assert!(!arbiter.is_standby().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_toggles_cancel_out() {
        let (tx, mut rx) = mpsc::channel(8);
        let arbiter = std::sync::Arc::new(PowerArbiter::new(tx));
        let first = tokio::spawn({
            let arbiter = arbiter.clone();
            async move { arbiter.toggle_manual().await.unwrap() }
        });
        let second = tokio::spawn({
            let arbiter = arbiter.clone();
            async move { arbiter.toggle_manual().await.unwrap() }
        });
        let requests = [first.await.unwrap(), second.await.unwrap()];
        assert!(requests.contains(&true) && requests.contains(&false));
        assert!(!arbiter.is_standby().await);

        assert_eq!(rx.recv().await, Some(SlideshowEvent::Power(PowerState::Standby)));
        assert_eq!(rx.recv().await, Some(SlideshowEvent::Power(PowerState::Active)));
        assert!(rx.try_recv().is_err());
    }
}
