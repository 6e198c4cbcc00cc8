//! Change feed subscriber.
//!
//! One subscription per active session, scoped to the session owner. Every
//! inbound event is handed to the reconciler; the engine never needs to know
//! whether it originated here or in another session of the same owner.
//!
//! A fresh subscription does not replay what was missed while the previous
//! one was down. With [`FeedRecovery::Reconnect`] the gap is repaired by a
//! full resync after re-subscribing; with [`FeedRecovery::Ignore`] the drop is
//! only logged and the collection stays as it was until the next resync.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{AbortRegistration, Abortable, LocalBoxFuture, poll_fn};
use futures::{FutureExt, StreamExt};
use tracing::{debug, error, info, warn};

use super::SyncEngine;
use crate::config::FeedRecovery;
use crate::error::{FeedError, SyncError};
use crate::model::{ChangeEvent, ChangeKind};
use crate::remote::RemoteStore;

/// How a [`FeedTask`] finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedExit {
    /// The session was torn down or replaced.
    TornDown,
    /// The subscription dropped and the recovery policy is `ignore`.
    Dropped(FeedError),
    /// Every re-subscribe attempt failed.
    Exhausted { attempts: u32 },
}

/// Drives the push subscription of one session. Spawn it on the local executor.
///
/// Resolves once the session ends or the feed cannot be recovered.
#[must_use = "the feed only runs while the task is polled"]
pub struct FeedTask {
    inner: Abortable<LocalBoxFuture<'static, FeedExit>>,
}

impl FeedTask {
    pub(super) fn new<R: RemoteStore + 'static>(
        engine: SyncEngine<R>,
        generation: u64,
        registration: AbortRegistration,
    ) -> Self {
        let run = async move { engine.run_feed(generation).await }.boxed_local();
        Self {
            inner: Abortable::new(run, registration),
        }
    }
}

impl Future for FeedTask {
    type Output = FeedExit;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(exit)) => Poll::Ready(exit),
            Poll::Ready(Err(_aborted)) => Poll::Ready(FeedExit::TornDown),
            Poll::Pending => Poll::Pending,
        }
    }
}

enum FeedPoll {
    Event(ChangeEvent),
    Dropped(FeedError),
    Ended,
}

impl<R: RemoteStore + 'static> SyncEngine<R> {
    async fn run_feed(&self, generation: u64) -> FeedExit {
        loop {
            match poll_fn(|cx| self.poll_feed(generation, cx)).await {
                FeedPoll::Event(event) => {
                    if self.apply_change(generation, &event).is_none() {
                        return FeedExit::TornDown;
                    }
                }
                FeedPoll::Ended => return FeedExit::TornDown,
                FeedPoll::Dropped(err) => {
                    warn!(generation, error = %err, "change feed dropped");
                    match self.config.feed.recovery {
                        FeedRecovery::Ignore => return FeedExit::Dropped(err),
                        FeedRecovery::Reconnect => {
                            if let Err(exit) = self.reconnect(generation).await {
                                return exit;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Poll the installed stream without holding the state borrow past the call.
    fn poll_feed(&self, generation: u64, cx: &mut Context<'_>) -> Poll<FeedPoll> {
        let mut state = self.state.borrow_mut();
        let Some(active) = state
            .active
            .as_mut()
            .filter(|active| active.generation == generation)
        else {
            return Poll::Ready(FeedPoll::Ended);
        };
        let Some(stream) = active.feed.as_mut() else {
            return Poll::Ready(FeedPoll::Ended);
        };

        match stream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(event))) => Poll::Ready(FeedPoll::Event(event)),
            Poll::Ready(Some(Err(err))) => {
                active.feed = None;
                Poll::Ready(FeedPoll::Dropped(err))
            }
            Poll::Ready(None) => {
                active.feed = None;
                Poll::Ready(FeedPoll::Dropped(FeedError::Closed("stream ended".into())))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Re-open the subscription, then resync if configured.
    ///
    /// A failed subscribe or a failed resync each use up one attempt. When
    /// the budget runs out the session stays active without a feed.
    async fn reconnect(&self, generation: u64) -> Result<(), FeedExit> {
        let attempts = self.config.feed.max_reconnect_attempts;
        let Some(owner) = self.with_active(generation, |active| active.session.owner().clone())
        else {
            return Err(FeedExit::TornDown);
        };

        let mut subscribed = false;
        for attempt in 1..=attempts {
            if !subscribed {
                match self.remote.subscribe(&owner, &ChangeKind::ALL).await {
                    Ok(stream) => {
                        if !self.install_feed(generation, stream) {
                            return Err(FeedExit::TornDown);
                        }
                        info!(owner = %owner, attempt, "change feed re-subscribed");
                        subscribed = true;
                    }
                    Err(err) => {
                        warn!(owner = %owner, attempt, error = %err, "re-subscribe failed");
                        if !self.is_current(generation) {
                            return Err(FeedExit::TornDown);
                        }
                        continue;
                    }
                }
            }

            if !self.config.feed.resync_on_reconnect {
                return Ok(());
            }
            match self.resync_generation(generation).await {
                Ok(_) => return Ok(()),
                Err(SyncError::SessionChanged) => return Err(FeedExit::TornDown),
                Err(err) => {
                    warn!(owner = %owner, attempt, error = %err, "resync after re-subscribe failed");
                }
            }
        }

        error!(owner = %owner, attempts, "change feed recovery exhausted");
        self.with_active(generation, |active| active.feed = None);
        debug!(generation, "feed task exiting without subscription");
        Err(FeedExit::Exhausted { attempts })
    }
}
