use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::remote::{RemotePhase, RemoteReplicaStatus};

/// Injected per replica by the compute service; the operator never sets it.
pub const RANK_ENV: &str = "RANK";
pub const WORLD_SIZE_ENV: &str = "WORLD_SIZE";
pub const NETWORK_ENABLED_ENV: &str = "NETWORK_ENABLED";

/// A replica is considered live when it heartbeated within this window.
pub const LIVENESS_WINDOW_SECS: i64 = 30;
/// A silent replica is only declared stalled after this many liveness
/// windows, so a single missed heartbeat never kills a job.
pub const STALL_GRACE_MULTIPLIER: i64 = 3;

/// Per-replica view persisted in the workload status. Ranks are assigned
/// once at creation and never change for the lifetime of the workload.
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaState {
    pub rank: u32,
    pub world_size: u32,
    #[serde(default)]
    pub ready: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub running_since: Option<DateTime<Utc>>,
}

/// Assigns ranks 0..world_size-1 for a distributed workload.
pub fn plan_replicas(world_size: u32) -> Vec<ReplicaState> {
    (0..world_size)
        .map(|rank| ReplicaState {
            rank,
            world_size,
            ..Default::default()
        })
        .collect()
}

/// Environment shared by every replica so the workload can form its own
/// process group without asking the operator anything at runtime. The
/// service appends the per-replica `RANK` on its side.
pub fn shared_env(world_size: u32, networking_enabled: bool) -> BTreeMap<String, String> {
    BTreeMap::from([
        (WORLD_SIZE_ENV.to_owned(), world_size.to_string()),
        (
            NETWORK_ENABLED_ENV.to_owned(),
            networking_enabled.to_string(),
        ),
    ])
}

/// Folds a remote status poll into the persisted replica states. Replicas
/// the poll didn't mention keep their previous state untouched.
pub fn observe(states: &mut [ReplicaState], observed: &[RemoteReplicaStatus], now: DateTime<Utc>) {
    for remote in observed {
        let Some(state) = states.iter_mut().find(|state| state.rank == remote.rank) else {
            continue;
        };

        if let Some(heartbeat) = remote.heartbeat {
            state.last_heartbeat = Some(heartbeat);
        }

        match remote.phase {
            RemotePhase::Running => {
                state.ready = true;
                if state.running_since.is_none() {
                    state.running_since = Some(now);
                }
            }
            RemotePhase::Queued | RemotePhase::Starting => state.ready = false,
            RemotePhase::Succeeded | RemotePhase::Failed => (),
        }
    }
}

pub fn all_ready(states: &[ReplicaState]) -> bool {
    !states.is_empty() && states.iter().all(|state| state.ready)
}

/// Ranks whose last heartbeat is older than the stall deadline. Replicas
/// that never became ready are not judged, they are still starting up.
pub fn stalled_ranks(states: &[ReplicaState], now: DateTime<Utc>) -> Vec<u32> {
    let deadline = Duration::seconds(LIVENESS_WINDOW_SECS * STALL_GRACE_MULTIPLIER);

    states
        .iter()
        .filter(|state| state.ready)
        .filter(|state| match state.last_heartbeat {
            Some(heartbeat) => now - heartbeat > deadline,
            None => false,
        })
        .map(|state| state.rank)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_replica(rank: u32, heartbeat: DateTime<Utc>) -> RemoteReplicaStatus {
        RemoteReplicaStatus {
            rank,
            phase: RemotePhase::Running,
            heartbeat: Some(heartbeat),
            ..Default::default()
        }
    }

    #[test]
    fn ranks_are_dense_and_zero_based() {
        let states = plan_replicas(4);

        assert_eq!(states.len(), 4);
        for (index, state) in states.iter().enumerate() {
            assert_eq!(state.rank, index as u32);
            assert_eq!(state.world_size, 4);
            assert!(!state.ready);
        }
    }

    #[test]
    fn shared_env_carries_cluster_shape() {
        let env = shared_env(4, true);

        assert_eq!(env[WORLD_SIZE_ENV], "4");
        assert_eq!(env[NETWORK_ENABLED_ENV], "true");
        assert!(!env.contains_key(RANK_ENV));
    }

    #[test]
    fn observe_marks_running_replicas_ready() {
        let now = Utc::now();
        let mut states = plan_replicas(2);

        observe(&mut states, &[running_replica(0, now)], now);

        assert!(states[0].ready);
        assert_eq!(states[0].last_heartbeat, Some(now));
        assert!(!states[1].ready);
        assert!(!all_ready(&states));

        observe(&mut states, &[running_replica(1, now)], now);

        assert!(all_ready(&states));
    }

    #[test]
    fn stall_detection_respects_the_grace_window() {
        let now = Utc::now();
        let mut states = plan_replicas(2);

        observe(
            &mut states,
            &[
                running_replica(0, now - Duration::seconds(LIVENESS_WINDOW_SECS * 2)),
                running_replica(1, now - Duration::seconds(LIVENESS_WINDOW_SECS * 4)),
            ],
            now,
        );

        assert_eq!(stalled_ranks(&states, now), vec![1]);
    }

    #[test]
    fn replicas_that_never_started_are_not_stalled() {
        let now = Utc::now();
        let states = plan_replicas(2);

        assert!(stalled_ranks(&states, now).is_empty());
    }
}
