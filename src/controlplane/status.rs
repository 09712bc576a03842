//! Status Aggregation
//!
//! Folds the controller's per-node placements into one service state and a
//! health state per user-visible volume.

use crate::domain::model::{
    ResourceState, ResourceStatus, ServiceState, VolumeStatus, CLUSTER_PRIVATE_VOLUME_NUMBER,
};
use crate::domain::ports::{DiskState, Resource, ResourceDefinition, ResourceGroup};
use std::collections::BTreeSet;

/// Compute the status of a resource
///
/// `attached` is whether the HA daemon currently manages the resource; with
/// no node in use it separates "starting" from "stopped".
pub fn status_from_resources(
    attached: bool,
    definition: Option<&ResourceDefinition>,
    group: Option<&ResourceGroup>,
    placements: &[Resource],
) -> ResourceStatus {
    if definition.is_none() {
        return ResourceStatus::default();
    }

    let primary = placements
        .iter()
        .find(|r| r.is_in_use())
        .map(|r| r.node_name.clone());

    let service = if primary.is_some() {
        ServiceState::Started
    } else if placements.is_empty() || placements.iter().any(|r| r.in_use.is_none()) {
        ServiceState::Unknown
    } else if attached {
        ServiceState::Starting
    } else {
        ServiceState::Stopped
    };

    let numbers: BTreeSet<u32> = placements
        .iter()
        .flat_map(|r| r.volumes.iter().map(|v| v.number))
        .filter(|n| *n != CLUSTER_PRIVATE_VOLUME_NUMBER)
        .collect();

    let volumes = numbers
        .into_iter()
        .map(|number| VolumeStatus {
            number,
            state: volume_state(number, group, placements),
        })
        .collect();

    ResourceStatus {
        service,
        primary,
        nodes: placements.iter().map(|r| r.node_name.clone()).collect(),
        volumes,
    }
}

fn volume_state(number: u32, group: Option<&ResourceGroup>, placements: &[Resource]) -> ResourceState {
    let Some(group) = group else {
        return ResourceState::Unknown;
    };

    let states: Vec<DiskState> = placements
        .iter()
        .filter(|r| !r.diskless)
        .filter_map(|r| r.volumes.iter().find(|v| v.number == number))
        .map(|v| v.disk_state)
        .collect();

    if states.iter().all(|s| *s == DiskState::Unknown) {
        return ResourceState::Unknown;
    }

    let up_to_date = states.iter().filter(|s| **s == DiskState::UpToDate).count() as u32;
    if up_to_date >= group.expected_replicas() {
        ResourceState::Ok
    } else {
        ResourceState::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ResourceVolume;

    fn definition() -> ResourceDefinition {
        ResourceDefinition {
            name: "export1".into(),
            resource_group: "DfltRscGrp".into(),
            props: Default::default(),
        }
    }

    fn group(place_count: u32) -> ResourceGroup {
        ResourceGroup {
            name: "DfltRscGrp".into(),
            place_count: Some(place_count),
        }
    }

    fn placement(node: &str, in_use: Option<bool>, disk: DiskState) -> Resource {
        Resource {
            name: "export1".into(),
            node_name: node.into(),
            in_use,
            diskless: false,
            volumes: vec![
                ResourceVolume { number: 0, device_path: None, disk_state: disk },
                ResourceVolume { number: 1, device_path: None, disk_state: disk },
            ],
        }
    }

    #[test]
    fn test_started_when_any_in_use() {
        let placements = vec![
            placement("node-a", Some(false), DiskState::UpToDate),
            placement("node-b", Some(true), DiskState::UpToDate),
        ];
        let status = status_from_resources(true, Some(&definition()), Some(&group(2)), &placements);

        assert_eq!(status.service, ServiceState::Started);
        assert_eq!(status.primary.as_deref(), Some("node-b"));
        assert_eq!(status.nodes, vec!["node-a", "node-b"]);
        assert_eq!(
            status.volumes,
            vec![VolumeStatus { number: 1, state: ResourceState::Ok }]
        );
    }

    #[test]
    fn test_stopped_and_starting() {
        let placements = vec![
            placement("node-a", Some(false), DiskState::UpToDate),
            placement("node-b", Some(false), DiskState::UpToDate),
        ];

        let detached = status_from_resources(false, Some(&definition()), Some(&group(2)), &placements);
        assert_eq!(detached.service, ServiceState::Stopped);
        assert_eq!(detached.primary, None);

        let attached = status_from_resources(true, Some(&definition()), Some(&group(2)), &placements);
        assert_eq!(attached.service, ServiceState::Starting);
    }

    #[test]
    fn test_unknown_without_data() {
        let status = status_from_resources(false, None, Some(&group(2)), &[]);
        assert_eq!(status, ResourceStatus::default());

        let status = status_from_resources(false, Some(&definition()), Some(&group(2)), &[]);
        assert_eq!(status.service, ServiceState::Unknown);
        assert!(status.volumes.is_empty());

        let placements = vec![placement("node-a", None, DiskState::Unknown)];
        let status = status_from_resources(false, Some(&definition()), Some(&group(2)), &placements);
        assert_eq!(status.service, ServiceState::Unknown);
        assert_eq!(status.volumes[0].state, ResourceState::Unknown);
    }

    #[test]
    fn test_degraded_when_replicas_missing() {
        let placements = vec![
            placement("node-a", Some(true), DiskState::UpToDate),
            placement("node-b", Some(false), DiskState::Outdated),
        ];
        let status = status_from_resources(true, Some(&definition()), Some(&group(2)), &placements);
        assert_eq!(status.volumes[0].state, ResourceState::Degraded);

        let status = status_from_resources(true, Some(&definition()), Some(&group(1)), &placements);
        assert_eq!(status.volumes[0].state, ResourceState::Ok);
    }

    #[test]
    fn test_diskless_placement_is_not_a_replica() {
        let mut tiebreaker = placement("node-c", Some(false), DiskState::UpToDate);
        tiebreaker.diskless = true;
        let placements = vec![placement("node-a", Some(true), DiskState::UpToDate), tiebreaker];

        let status = status_from_resources(true, Some(&definition()), Some(&group(2)), &placements);
        assert_eq!(status.volumes[0].state, ResourceState::Degraded);
    }
}
