use std::cmp::Ordering;
use std::sync::Arc;

use kube::{Resource, ResourceExt};
use semver::Version;

use crate::crd::CatalogKind;

/// Parsed ordering key for one election candidate
struct Candidate {
    store_name: String,
    version: Option<Version>,
    creation: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>,
    revision: Option<String>,
    currently_latest: bool,
}

fn candidate<K: CatalogKind>(record: &K) -> Candidate {
    Candidate {
        store_name: record.name_any(),
        version: if K::SEMVER_VERSIONED {
            Version::parse(&record.entry().version).ok()
        } else {
            None
        },
        creation: record.meta().creation_timestamp.clone(),
        revision: record.meta().resource_version.clone(),
        currently_latest: record.status().map(|s| s.is_latest).unwrap_or(false),
    }
}

/// Ranks candidates for election: semver descending, then creation
/// ascending (the older record wins an exact version tie, for stability),
/// then store revision descending, then store-name for total determinism.
/// A record whose version does not parse never outranks one that does.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    match (&a.version, &b.version) {
        (Some(va), Some(vb)) if va != vb => return vb.cmp(va),
        (Some(_), None) => return Ordering::Less,
        (None, Some(_)) => return Ordering::Greater,
        _ => {}
    }

    match (&a.creation, &b.creation) {
        (Some(ca), Some(cb)) if ca != cb => return ca.0.cmp(&cb.0),
        (Some(_), None) => return Ordering::Less,
        (None, Some(_)) => return Ordering::Greater,
        _ => {}
    }

    let rev = revision_ord(b.revision.as_deref()).cmp(&revision_ord(a.revision.as_deref()));
    if rev != Ordering::Equal {
        return rev;
    }

    a.store_name.cmp(&b.store_name)
}

/// Revision tokens are opaque; order numerically when they parse, else
/// lexicographically.
fn revision_ord(revision: Option<&str>) -> (u64, String) {
    match revision {
        Some(raw) => (
            raw.parse::<u64>().unwrap_or(0),
            raw.to_string(),
        ),
        None => (0, String::new()),
    }
}

/// Store-name of the election winner for a version group, if any candidate
/// is electable. For semver kinds, only parseable versions can win while a
/// parseable candidate exists.
pub fn elect_latest<K: CatalogKind>(group: &[Arc<K>]) -> Option<String> {
    let mut candidates: Vec<Candidate> = group.iter().map(|r| candidate(r.as_ref())).collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by(rank);
    Some(candidates[0].store_name.clone())
}

/// The status writes a group needs to satisfy unique-latest: `(store_name,
/// desired_is_latest)` for every record whose flag is wrong, losers first
/// and the winner last so no observer ever sees two latest records.
pub fn election_updates<K: CatalogKind>(group: &[Arc<K>]) -> Vec<(String, bool)> {
    let winner = match elect_latest(group) {
        Some(winner) => winner,
        None => return Vec::new(),
    };

    let mut updates: Vec<(String, bool)> = Vec::new();
    let mut winner_update: Option<(String, bool)> = None;

    for record in group {
        let c = candidate(record.as_ref());
        let desired = c.store_name == winner;
        if desired == c.currently_latest {
            continue;
        }
        if desired {
            winner_update = Some((c.store_name, true));
        } else {
            updates.push((c.store_name, false));
        }
    }

    updates.sort();
    if let Some(update) = winner_update {
        updates.push(update);
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CatalogEntry, CatalogStatus, MCPServerCatalog, ModelCatalog};
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use rstest::rstest;

    fn record(
        version: &str,
        created_secs: i64,
        revision: &str,
        latest: bool,
    ) -> Arc<MCPServerCatalog> {
        let store = crate::crd::store_name("tool", version);
        let mut obj = MCPServerCatalog::from_discovered(
            &store,
            CatalogEntry {
                name: "tool".to_string(),
                version: version.to_string(),
                ..Default::default()
            },
        );
        obj.metadata.creation_timestamp = Some(Time(
            Utc.timestamp_opt(1_700_000_000 + created_secs, 0)
                .single()
                .expect("valid timestamp"),
        ));
        obj.metadata.resource_version = Some(revision.to_string());
        obj.status = Some(CatalogStatus {
            is_latest: latest,
            ..Default::default()
        });
        Arc::new(obj)
    }

    #[test]
    fn highest_semver_wins() {
        let group = vec![
            record("1.0.0", 0, "1", false),
            record("2.0.0", 10, "2", false),
            record("1.5.0", 20, "3", false),
        ];
        assert_eq!(elect_latest(&group).as_deref(), Some("tool-2-0-0"));
    }

    #[rstest]
    #[case("2.0.0-rc.1", "2.0.0", "tool-2-0-0")]
    #[case("2.0.0-alpha", "2.0.0-beta", "tool-2-0-0-beta")]
    #[case("1.9.9", "1.10.0", "tool-1-10-0")]
    fn semver_precedence_is_standard(
        #[case] a: &str,
        #[case] b: &str,
        #[case] expected: &str,
    ) {
        let group = vec![record(a, 0, "1", false), record(b, 10, "2", false)];
        assert_eq!(elect_latest(&group).as_deref(), Some(expected));
    }

    #[test]
    fn equal_versions_tie_break_to_the_older_record() {
        // Same semver under two store-names can only happen transiently
        // (rename races); the older record wins for stability.
        let mut newer = record("1.0.0", 100, "9", false);
        Arc::make_mut(&mut newer).metadata.name = Some("tool-1-0-0-copy".to_string());
        let group = vec![newer, record("1.0.0", 0, "1", false)];
        assert_eq!(elect_latest(&group).as_deref(), Some("tool-1-0-0"));
    }

    #[test]
    fn unparsable_versions_never_beat_parseable_ones() {
        let group = vec![
            record("not-a-version", 0, "1", false),
            record("0.1.0", 10, "2", false),
        ];
        assert_eq!(elect_latest(&group).as_deref(), Some("tool-0-1-0"));
    }

    #[test]
    fn updates_are_losers_first_winner_last() {
        let group = vec![
            record("1.0.0", 0, "1", true),
            record("2.0.0", 10, "2", false),
            record("1.5.0", 20, "3", true),
        ];
        let updates = election_updates(&group);
        assert_eq!(
            updates,
            vec![
                ("tool-1-0-0".to_string(), false),
                ("tool-1-5-0".to_string(), false),
                ("tool-2-0-0".to_string(), true),
            ]
        );
    }

    #[test]
    fn settled_groups_need_no_writes() {
        let group = vec![
            record("1.0.0", 0, "1", false),
            record("2.0.0", 10, "2", true),
        ];
        assert!(election_updates(&group).is_empty());
    }

    #[test]
    fn singleton_group_elects_itself() {
        let group = vec![record("1.0.0", 0, "1", false)];
        assert_eq!(
            election_updates(&group),
            vec![("tool-1-0-0".to_string(), true)]
        );
    }

    #[test]
    fn empty_group_elects_nothing() {
        let group: Vec<Arc<MCPServerCatalog>> = Vec::new();
        assert!(elect_latest(&group).is_none());
        assert!(election_updates(&group).is_empty());
    }

    /// Applies one round of election writes to an in-memory group,
    /// returning how many writes were issued.
    fn apply_updates(group: &mut [Arc<MCPServerCatalog>]) -> usize {
        let updates = election_updates(&group.to_vec());
        for (store, desired) in &updates {
            if let Some(record) = group.iter_mut().find(|r| r.name_any() == *store) {
                Arc::make_mut(record)
                    .status
                    .get_or_insert_with(Default::default)
                    .is_latest = *desired;
            }
        }
        updates.len()
    }

    fn latest_versions(group: &[Arc<MCPServerCatalog>]) -> Vec<String> {
        group
            .iter()
            .filter(|r| r.status.as_ref().map(|s| s.is_latest).unwrap_or(false))
            .map(|r| r.entry().version.clone())
            .collect()
    }

    #[test]
    fn creating_a_newer_version_moves_the_latest_flag() {
        let mut group = vec![record("1.0.0", 0, "1", false)];
        while apply_updates(&mut group) > 0 {}
        assert_eq!(latest_versions(&group), vec!["1.0.0"]);

        group.push(record("2.0.0", 10, "2", false));
        while apply_updates(&mut group) > 0 {}
        assert_eq!(latest_versions(&group), vec!["2.0.0"]);
    }

    #[test]
    fn deleting_the_latest_promotes_the_survivor() {
        let mut group = vec![
            record("1.0.0", 0, "1", false),
            record("2.0.0", 10, "2", false),
        ];
        while apply_updates(&mut group) > 0 {}

        group.retain(|r| r.entry().version != "2.0.0");
        while apply_updates(&mut group) > 0 {}
        assert_eq!(latest_versions(&group), vec!["1.0.0"]);
    }

    #[test]
    fn any_quiescent_group_has_exactly_one_latest() {
        // start from a deliberately inconsistent state
        let mut group = vec![
            record("0.9.0", 0, "1", true),
            record("1.0.0", 5, "2", true),
            record("1.0.1-rc.1", 8, "3", false),
            record("1.0.1", 10, "4", false),
        ];
        while apply_updates(&mut group) > 0 {}
        assert_eq!(latest_versions(&group), vec!["1.0.1"]);

        // a second pass is a no-op
        assert_eq!(apply_updates(&mut group), 0);
    }

    #[test]
    fn model_singletons_elect_without_semver() {
        let mut model = ModelCatalog::from_discovered(
            "gpt-large-2025",
            CatalogEntry {
                name: "gpt-large".to_string(),
                version: "2025".to_string(),
                ..Default::default()
            },
        );
        model.metadata.resource_version = Some("5".to_string());
        let group = vec![Arc::new(model)];
        assert_eq!(elect_latest(&group).as_deref(), Some("gpt-large-2025"));
    }
}
