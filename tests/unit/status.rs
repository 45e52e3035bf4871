//! Unit tests for condition handling

use workload_identity_operator::controller::status::{
    ConditionBuilder, ConditionUpdate, PendingConditions, condition_status, condition_types,
    find_condition, is_condition_true,
};
use workload_identity_operator::crd::{OperandKind, WorkloadIdentityManagerStatus};

use crate::common::*;

mod condition_builder_tests {
    use super::*;

    #[test]
    fn test_new_builder_is_empty() {
        assert!(ConditionBuilder::new(Some(1)).build().is_empty());
    }

    #[test]
    fn test_set_condition_adds_new() {
        let conditions = ConditionBuilder::new(Some(3))
            .ready(true, "Ready", "all good")
            .build();

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, condition_types::READY);
        assert_eq!(conditions[0].status, condition_status::TRUE);
        assert_eq!(conditions[0].observed_generation, Some(3));
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut existing = condition(condition_types::READY, condition_status::TRUE, "Ready");
        existing.last_transition_time = "2024-01-01T00:00:00Z".to_string();

        let conditions = ConditionBuilder::from_existing(vec![existing], Some(2))
            .ready(true, "Ready", "new message")
            .build();

        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].message, "new message");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn test_transition_time_moves_on_status_change() {
        let mut existing = condition(condition_types::READY, condition_status::TRUE, "Ready");
        existing.last_transition_time = "2024-01-01T00:00:00Z".to_string();

        let conditions = ConditionBuilder::from_existing(vec![existing], Some(1))
            .ready(false, "OperandsNotReady", "waiting")
            .build();

        assert_eq!(conditions[0].status, condition_status::FALSE);
        assert_ne!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_composite_helpers() {
        let conditions = ConditionBuilder::new(Some(1))
            .ready(true, "Ready", "")
            .upgradeable(false, "CreateOnlyModeEnabled", "")
            .degraded(false, "AsExpected", "")
            .build();

        assert!(is_condition_true(&conditions, condition_types::READY));
        assert!(!is_condition_true(&conditions, condition_types::UPGRADEABLE));
        assert!(!is_condition_true(&conditions, condition_types::DEGRADED));
        assert!(find_condition(&conditions, "Missing").is_none());
    }
}

mod pending_conditions_tests {
    use super::*;

    #[test]
    fn test_later_update_of_same_type_wins() {
        let mut pending = PendingConditions::new();
        pending.set(condition_types::SERVICE_AVAILABLE, condition_status::FALSE, "ReconcileFailed", "boom");
        pending.set(condition_types::SERVICE_AVAILABLE, condition_status::TRUE, "Available", "ok");

        assert_eq!(pending.len(), 1);
        let merged = pending.apply_to(Vec::new(), Some(1));
        assert_eq!(find(&merged, condition_types::SERVICE_AVAILABLE).reason, "Available");
    }

    #[test]
    fn test_apply_keeps_unrelated_conditions() {
        let existing = vec![condition(
            condition_types::CREATE_ONLY_MODE,
            condition_status::TRUE,
            "CreateOnlyModeEnabled",
        )];
        let mut pending = PendingConditions::new();
        pending.push(ConditionUpdate::new(
            condition_types::READY,
            condition_status::TRUE,
            "Ready",
            "done",
        ));

        let merged = pending.apply_to(existing, Some(1));
        assert_eq!(merged.len(), 2);
        assert!(is_condition_true(&merged, condition_types::CREATE_ONLY_MODE));
        assert!(is_condition_true(&merged, condition_types::READY));
    }

    #[test]
    fn test_reapplying_is_idempotent() {
        let mut pending = PendingConditions::new();
        pending.set(condition_types::CONFIG_VALID, condition_status::TRUE, "ValidConfiguration", "ok");
        pending.set(condition_types::READY, condition_status::TRUE, "Ready", "ok");

        let first = pending.apply_to(Vec::new(), Some(4));
        let second = pending.apply_to(first.clone(), Some(4));
        assert_eq!(first, second);
    }
}

mod operand_entry_tests {
    use super::*;

    #[test]
    fn test_upsert_replaces_entry_of_same_kind() {
        let mut status = WorkloadIdentityManagerStatus::default();
        status.upsert_operand(operand_entry(OperandKind::SpireAgent, false));
        status.upsert_operand(operand_entry(OperandKind::SpireAgent, true));

        assert_eq!(status.operands.len(), 1);
        assert!(status.operand(OperandKind::SpireAgent).unwrap().is_ready());
    }

    #[test]
    fn test_entries_are_ordered_by_kind() {
        let mut status = WorkloadIdentityManagerStatus::default();
        status.upsert_operand(operand_entry(OperandKind::SpireOidcDiscoveryProvider, true));
        status.upsert_operand(operand_entry(OperandKind::SpireServer, true));
        status.upsert_operand(operand_entry(OperandKind::SpiffeCsiDriver, true));

        let kinds: Vec<_> = status.operands.iter().map(|o| o.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OperandKind::SpireServer,
                OperandKind::SpiffeCsiDriver,
                OperandKind::SpireOidcDiscoveryProvider,
            ]
        );
    }
}
