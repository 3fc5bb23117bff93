//! Property tests for the deployment status fold.

use labfleet_orchestrator::domain::{
    derive_status, DeploymentStatus, InstanceSnapshot, InstanceStatus,
};
use proptest::prelude::*;
use rstest::rstest;

fn instance_status() -> impl Strategy<Value = InstanceStatus> {
    prop_oneof![
        Just(InstanceStatus::Creating),
        Just(InstanceStatus::Running),
        Just(InstanceStatus::Failed),
        Just(InstanceStatus::Deleted),
    ]
}

fn snapshot() -> impl Strategy<Value = InstanceSnapshot> {
    (instance_status(), any::<bool>()).prop_map(|(status, dispatched)| InstanceSnapshot {
        status,
        // Anything past CREATING was handed off at some point.
        dispatched: dispatched || status != InstanceStatus::Creating,
    })
}

fn snap(status: InstanceStatus, dispatched: bool) -> InstanceSnapshot {
    InstanceSnapshot { status, dispatched }
}

proptest! {
    #[test]
    fn fold_follows_precedence(snapshots in prop::collection::vec(snapshot(), 0..12)) {
        let status = derive_status(snapshots.iter().copied());
        let has = |s: InstanceStatus| snapshots.iter().any(|i| i.status == s);

        let expected = if snapshots.is_empty() {
            DeploymentStatus::Queued
        } else if snapshots.iter().all(|i| i.status == InstanceStatus::Deleted) {
            DeploymentStatus::Deleted
        } else if has(InstanceStatus::Creating) {
            if snapshots.iter().any(|i| i.dispatched) {
                DeploymentStatus::Creating
            } else {
                DeploymentStatus::Queued
            }
        } else if has(InstanceStatus::Failed) {
            DeploymentStatus::Failed
        } else {
            DeploymentStatus::Running
        };
        prop_assert_eq!(status, expected);
    }

    #[test]
    fn fold_ignores_instance_order(mut snapshots in prop::collection::vec(snapshot(), 1..12)) {
        let forward = derive_status(snapshots.iter().copied());
        snapshots.reverse();
        prop_assert_eq!(forward, derive_status(snapshots.iter().copied()));
    }

    #[test]
    fn running_requires_every_live_instance_running(
        snapshots in prop::collection::vec(snapshot(), 1..12)
    ) {
        if derive_status(snapshots.iter().copied()) == DeploymentStatus::Running {
            prop_assert!(snapshots.iter().all(|i| matches!(
                i.status,
                InstanceStatus::Running | InstanceStatus::Deleted
            )));
            prop_assert!(snapshots.iter().any(|i| i.status == InstanceStatus::Running));
        }
    }
}

#[rstest]
#[case::empty(vec![], DeploymentStatus::Queued)]
#[case::not_yet_handed_off(vec![snap(InstanceStatus::Creating, false)], DeploymentStatus::Queued)]
#[case::handed_off(
    vec![snap(InstanceStatus::Creating, true), snap(InstanceStatus::Creating, false)],
    DeploymentStatus::Creating
)]
#[case::creating_beats_failed(
    vec![snap(InstanceStatus::Failed, true), snap(InstanceStatus::Creating, true)],
    DeploymentStatus::Creating
)]
#[case::failed_beats_running(
    vec![snap(InstanceStatus::Running, true), snap(InstanceStatus::Failed, true)],
    DeploymentStatus::Failed
)]
#[case::partially_deleted(
    vec![snap(InstanceStatus::Running, true), snap(InstanceStatus::Deleted, true)],
    DeploymentStatus::Running
)]
#[case::all_deleted(
    vec![snap(InstanceStatus::Deleted, true), snap(InstanceStatus::Deleted, true)],
    DeploymentStatus::Deleted
)]
fn fold_examples(#[case] snapshots: Vec<InstanceSnapshot>, #[case] expected: DeploymentStatus) {
    assert_eq!(derive_status(snapshots), expected);
}
