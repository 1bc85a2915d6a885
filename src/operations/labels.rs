//! Pod operation labels
//!
//! The `operation-*` labels of a pod are the distributed half of the pod
//! operation state machine; [`PodLastOperation`] in the rack status is the
//! authoritative half. [`converge`] checks that both sides agree.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;

use crate::crd::{OperationKind, OperationStatus, PodLastOperation};
use crate::domain::PodInfo;

pub const OPERATION_NAME: &str = "operation-name";
pub const OPERATION_STATUS: &str = "operation-status";
pub const OPERATION_START: &str = "operation-start";
pub const OPERATION_END: &str = "operation-end";
pub const OPERATION_ARGUMENT: &str = "operation-argument";

/// Timestamp format usable as a label value
pub const LABEL_TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

pub fn format_label_time(at: DateTime<Utc>) -> String {
    at.format(LABEL_TIME_FORMAT).to_string()
}

pub fn parse_label_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, LABEL_TIME_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

/// Operation labels of a pod, parsed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodLabelState {
    pub name: Option<OperationKind>,
    pub status: Option<OperationStatus>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub argument: Option<String>,
}

impl PodLabelState {
    pub fn of(pod: &PodInfo) -> Self {
        Self {
            name: pod.label(OPERATION_NAME).and_then(OperationKind::parse),
            status: pod.label(OPERATION_STATUS).and_then(OperationStatus::parse),
            start: pod.label(OPERATION_START).and_then(parse_label_time),
            end: pod.label(OPERATION_END).and_then(parse_label_time),
            argument: pod
                .label(OPERATION_ARGUMENT)
                .filter(|a| !a.is_empty())
                .map(String::from),
        }
    }

    pub fn is(&self, kind: OperationKind, status: OperationStatus) -> bool {
        self.name == Some(kind) && self.status == Some(status)
    }
}

/// Selector of the pods waiting for `kind`
pub fn todo_selector(
    mut rack_selector: BTreeMap<String, String>,
    kind: OperationKind,
) -> BTreeMap<String, String> {
    rack_selector.insert(OPERATION_NAME.to_string(), kind.to_string());
    rack_selector.insert(OPERATION_STATUS.to_string(), OperationStatus::ToDo.to_string());
    rack_selector
}

/// Labels queueing `kind` on a pod, as ToDo or Manual
pub fn queued_labels(kind: OperationKind, status: OperationStatus) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OPERATION_NAME.to_string(), kind.to_string()),
        (OPERATION_STATUS.to_string(), status.to_string()),
    ])
}

/// Labels of a pod on which `kind` just started
pub fn started_labels(kind: OperationKind, now: DateTime<Utc>) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OPERATION_NAME.to_string(), kind.to_string()),
        (OPERATION_STATUS.to_string(), OperationStatus::Ongoing.to_string()),
        (OPERATION_START.to_string(), format_label_time(now)),
        (OPERATION_END.to_string(), String::new()),
    ])
}

/// Labels of a pod whose operation finished
pub fn finished_labels(succeeded: bool, now: DateTime<Utc>) -> BTreeMap<String, String> {
    let status = if succeeded {
        OperationStatus::Done
    } else {
        OperationStatus::Error
    };
    BTreeMap::from([
        (OPERATION_STATUS.to_string(), status.to_string()),
        (OPERATION_END.to_string(), format_label_time(now)),
    ])
}

/// Agreement between a pod's labels and the rack operation record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    /// The record says nothing about this pod
    Untracked,
    Converged,
    Diverged {
        expected: OperationStatus,
        observed: Option<OperationStatus>,
    },
}

/// Compare the labels of `pod` with what `operation` says about it
pub fn converge(pod: &PodInfo, operation: &PodLastOperation) -> Convergence {
    let Some(kind) = operation.name else {
        return Convergence::Untracked;
    };
    let expected = if operation.pods.contains(&pod.name) {
        OperationStatus::Ongoing
    } else if operation.pods_ok.contains(&pod.name) {
        OperationStatus::Done
    } else if operation.pods_ko.contains(&pod.name) {
        OperationStatus::Error
    } else {
        return Convergence::Untracked;
    };

    let labels = PodLabelState::of(pod);
    if labels.is(kind, expected) {
        Convergence::Converged
    } else {
        Convergence::Diverged {
            expected,
            observed: labels.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pod(labels: BTreeMap<String, String>) -> PodInfo {
        PodInfo {
            name: "c-dc1-rack1-0".into(),
            labels,
            ..Default::default()
        }
    }

    #[test]
    fn test_label_time() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(format_label_time(at), "20240309T070501");
        assert_eq!(parse_label_time("20240309T070501"), Some(at));
        assert_eq!(parse_label_time(""), None);
    }

    #[test]
    fn test_label_state() {
        let now = Utc::now();
        let mut labels = started_labels(OperationKind::Rebuild, now);
        labels.insert(OPERATION_ARGUMENT.into(), "dc2".into());
        let state = PodLabelState::of(&pod(labels));
        assert!(state.is(OperationKind::Rebuild, OperationStatus::Ongoing));
        assert_eq!(state.argument.as_deref(), Some("dc2"));
        assert!(state.end.is_none());
    }

    #[test]
    fn test_converge() {
        let mut op = PodLastOperation::default();
        let p = pod(started_labels(OperationKind::Cleanup, Utc::now()));
        assert_eq!(converge(&p, &op), Convergence::Untracked);

        op.reset(OperationKind::Cleanup, OperationStatus::Ongoing, Utc::now());
        op.track(&p.name);
        assert_eq!(converge(&p, &op), Convergence::Converged);

        op.settle(&p.name, true);
        assert_eq!(
            converge(&p, &op),
            Convergence::Diverged {
                expected: OperationStatus::Done,
                observed: Some(OperationStatus::Ongoing),
            }
        );
    }

    #[test]
    fn test_todo_selector() {
        let selector = todo_selector(BTreeMap::new(), OperationKind::UpgradeSSTables);
        assert_eq!(selector[OPERATION_NAME], "upgradesstables");
        assert_eq!(selector[OPERATION_STATUS], "ToDo");
    }
}
