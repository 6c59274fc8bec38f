//! Leader election for the singleton scheduler.
//!
//! Each instance registers a sequential-ephemeral member under
//! `/scheduler-leader`; the lowest sequence number leads and runs the
//! scheduler. Standby members watch their immediate predecessor only (no
//! herd). When the session is lost the scheduler is stopped and its state
//! discarded; on re-registration under the fresh session a new scheduler
//! starts with a full resynchronization pass. The store's session semantics
//! fence a deposed leader: its ephemerals are gone and new leadership
//! decisions no longer include it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::scheduler::Scheduler;
use crate::store::{CoordStore, CreateMode, SessionState, StoreError, StoreEvent, paths};

const REJOIN_DELAY: Duration = Duration::from_millis(500);

pub(crate) struct SchedulerSelector {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl SchedulerSelector {
    pub fn start(store: Arc<dyn CoordStore>, sweep_interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let task = ElectionTask {
            store,
            sweep_interval,
            stop: stop.clone(),
        };
        let handle = tokio::spawn(task.run());
        Self { stop, handle }
    }

    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(err) = self.handle.await {
            error!(?err, "scheduler selector task panicked");
        }
    }
}

struct ElectionTask {
    store: Arc<dyn CoordStore>,
    sweep_interval: Duration,
    stop: CancellationToken,
}

impl ElectionTask {
    async fn run(self) {
        let mut session_rx = self.store.session_events();
        while !self.stop.is_cancelled() {
            let generation = session_rx.borrow().generation;
            let member_prefix = format!("{}/member-", paths::SCHEDULER_LEADER_PATH);
            let my_path = match self
                .store
                .create(
                    &member_prefix,
                    self.store.instance_name().as_bytes().to_vec(),
                    CreateMode::EphemeralSequential,
                )
                .await
            {
                Ok(path) => path,
                Err(err) => {
                    warn!(?err, "failed to join scheduler election, retrying");
                    tokio::select! {
                        _ = self.stop.cancelled() => return,
                        _ = sleep(REJOIN_DELAY) => continue,
                    }
                }
            };
            let my_name = paths::child_name(&my_path).to_string();
            info!(member = %my_name, "joined scheduler election");

            let exit = self
                .membership_loop(&my_name, generation, &mut session_rx)
                .await;

            // drop the member node when stepping down with a live session so
            // a re-registration cannot deadlock behind it
            match self.store.delete(&my_path).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(err) => warn!(?err, "failed to remove election member node"),
            }
            if exit == MembershipExit::Stopped {
                return;
            }
        }
    }

    async fn membership_loop(
        &self,
        my_name: &str,
        generation: u64,
        session_rx: &mut watch::Receiver<SessionState>,
    ) -> MembershipExit {
        loop {
            if self.stop.is_cancelled() {
                return MembershipExit::Stopped;
            }
            let mut members = match self.store.children(paths::SCHEDULER_LEADER_PATH).await {
                Ok(members) => members,
                Err(err) => {
                    warn!(?err, "failed to list election members");
                    return MembershipExit::Rejoin;
                }
            };
            members.sort_by_key(|name| member_sequence(name));
            let Some(position) = members.iter().position(|member| member == my_name) else {
                warn!(member = %my_name, "election member node lost");
                return MembershipExit::Rejoin;
            };

            if position == 0 {
                info!(member = %my_name, "acquired scheduler leadership");
                let sched_stop = self.stop.child_token();
                let scheduler = Scheduler::new(self.store.clone(), self.sweep_interval);
                let run_fut = scheduler.run(sched_stop.clone());
                tokio::pin!(run_fut);
                tokio::select! {
                    _ = &mut run_fut => {
                        warn!("scheduler loop exited while leader, re-electing");
                        tokio::select! {
                            _ = self.stop.cancelled() => return MembershipExit::Stopped,
                            _ = sleep(REJOIN_DELAY) => {}
                        }
                    }
                    _ = self.stop.cancelled() => {
                        sched_stop.cancel();
                        run_fut.await;
                        return MembershipExit::Stopped;
                    }
                    _ = session_lost(session_rx, generation) => {
                        sched_stop.cancel();
                        run_fut.await;
                        info!(member = %my_name, "session lost, stepping down");
                        return MembershipExit::Rejoin;
                    }
                }
            } else {
                let predecessor = members[position - 1].clone();
                let predecessor_path =
                    format!("{}/{predecessor}", paths::SCHEDULER_LEADER_PATH);
                let mut predecessor_rx = match self.store.watch_node(&predecessor_path).await {
                    Ok(rx) => rx,
                    Err(err) => {
                        warn!(?err, "failed to watch election predecessor");
                        continue;
                    }
                };
                // close the race against a predecessor that vanished before
                // the watch was registered
                match self.store.get(&predecessor_path).await {
                    Ok(_) => {}
                    Err(StoreError::NotFound(_)) => continue,
                    Err(err) => {
                        warn!(?err, "failed to check election predecessor");
                        continue;
                    }
                }
                debug!(
                    member = %my_name,
                    predecessor = %predecessor,
                    "waiting on election predecessor"
                );
                loop {
                    tokio::select! {
                        _ = self.stop.cancelled() => return MembershipExit::Stopped,
                        _ = session_lost(session_rx, generation) => {
                            info!(member = %my_name, "session lost while standby");
                            return MembershipExit::Rejoin;
                        }
                        event = predecessor_rx.recv() => match event {
                            Some(StoreEvent::Deleted(_)) | None => break,
                            Some(_) => {}
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MembershipExit {
    /// Shutdown requested; leave the election entirely.
    Stopped,
    /// Session or member node lost; re-register and try again.
    Rejoin,
}

/// Resolves when the client's session leaves the given generation.
async fn session_lost(rx: &mut watch::Receiver<SessionState>, generation: u64) {
    loop {
        {
            let state = rx.borrow();
            if state.generation != generation || !state.connected {
                return;
            }
        }
        if rx.changed().await.is_err() {
            // session sender gone; nothing further will change
            std::future::pending::<()>().await;
        }
    }
}

fn member_sequence(name: &str) -> u64 {
    name.rsplit('-')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_sequence_orders_by_suffix() {
        assert!(member_sequence("member-0000000001") < member_sequence("member-0000000002"));
        assert_eq!(member_sequence("member-0000000042"), 42);
        assert_eq!(member_sequence("garbage"), u64::MAX);
    }
}
