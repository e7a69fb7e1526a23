use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::Resource;
use std::fmt;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_PUBLISHED: &str = "Published";

/// The only values Kubernetes allows for a condition status
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Builds a [`Condition`], carrying `lastTransitionTime` forward from the
/// matching current condition unless the status flips. `observedGeneration`
/// comes from the resource's metadata.
pub fn build_condition<T>(
    resource: &T,
    current_conditions: Option<&[Condition]>,
    message: String,
    reason: String,
    status: ConditionStatus,
    condition_type: &str,
) -> Condition
where
    T: Resource,
{
    let old_condition = current_conditions.and_then(|conditions| {
        conditions
            .iter()
            .find(|condition| condition.type_ == condition_type)
    });

    let last_transition_time = match old_condition {
        Some(condition) if condition.status == status.to_string() => {
            condition.last_transition_time.clone()
        }
        _ => Time(Utc::now()),
    };

    Condition {
        last_transition_time,
        message,
        observed_generation: resource.meta().generation,
        reason,
        status: status.to_string(),
        type_: condition_type.to_string(),
    }
}

/// Upserts `condition` into the set, replacing any condition of the same
/// type.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CatalogEntry, CatalogKind, MCPServerCatalog};

    fn record() -> MCPServerCatalog {
        MCPServerCatalog::from_discovered(
            "tool-1-0-0",
            CatalogEntry {
                name: "tool".to_string(),
                version: "1.0.0".to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn transition_time_survives_when_status_is_unchanged() {
        let obj = record();
        let first = build_condition(
            &obj,
            None,
            "ok".to_string(),
            "Reconciled".to_string(),
            ConditionStatus::True,
            CONDITION_READY,
        );
        let current = vec![first.clone()];

        let second = build_condition(
            &obj,
            Some(&current),
            "still ok, new words".to_string(),
            "Reconciled".to_string(),
            ConditionStatus::True,
            CONDITION_READY,
        );

        assert_eq!(second.last_transition_time, first.last_transition_time);
        assert_eq!(second.message, "still ok, new words");
    }

    #[test]
    fn transition_time_bumps_when_status_flips() {
        let obj = record();
        let mut first = build_condition(
            &obj,
            None,
            "ok".to_string(),
            "Reconciled".to_string(),
            ConditionStatus::True,
            CONDITION_READY,
        );
        // age the first condition so a bump is observable
        first.last_transition_time = Time(Utc::now() - chrono::Duration::hours(1));
        let current = vec![first.clone()];

        let second = build_condition(
            &obj,
            Some(&current),
            "broken".to_string(),
            "InvalidVersion".to_string(),
            ConditionStatus::False,
            CONDITION_READY,
        );

        assert!(second.last_transition_time.0 > first.last_transition_time.0);
    }

    #[test]
    fn set_condition_replaces_by_type() {
        let obj = record();
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            build_condition(
                &obj,
                None,
                "a".to_string(),
                "R".to_string(),
                ConditionStatus::True,
                CONDITION_READY,
            ),
        );
        set_condition(
            &mut conditions,
            build_condition(
                &obj,
                None,
                "b".to_string(),
                "R".to_string(),
                ConditionStatus::True,
                CONDITION_PUBLISHED,
            ),
        );
        set_condition(
            &mut conditions,
            build_condition(
                &obj,
                None,
                "c".to_string(),
                "R".to_string(),
                ConditionStatus::False,
                CONDITION_READY,
            ),
        );

        assert_eq!(conditions.len(), 2);
        let ready = find_condition(&conditions, CONDITION_READY).expect("present");
        assert_eq!(ready.status, "False");
        assert_eq!(ready.message, "c");
    }
}
