//! Branch action classifier.
//!
//! Pure decision logic: given the persisted view of a remote, the freshly
//! observed view, and a handful of flags, produce exactly one
//! [`BranchAction`]. No I/O happens here; the monitor owns applying the
//! decision. Keeping this a pure function is what makes the reconciliation
//! rules testable as a literal decision table.

use chrono::{DateTime, Duration, Utc};

use crate::errors::MonitorError;
use crate::store::models::{ObservedRemote, RefKind, RemoteState, TrackedRemote};

/// One reconciliation decision for a single remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchAction {
    /// Remote seen for the first time; record it.
    New,
    /// Remote moved (or a queued build must be re-queued); update and build.
    Change,
    /// Nothing observable changed.
    Done,
    /// Tracked but not eligible for building right now.
    Inactive,
    /// Remote vanished from the repository.
    Deleted,
    /// A build that was mid-flight before restart; cannot be trusted.
    Failed,
}

/// Context flags for one classification call.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyFlags {
    /// The application was discovered during this monitor's initialisation,
    /// so nothing it carries should be auto-built on first sight.
    pub is_new_application: bool,
    /// This is the monitor's very first reconciliation since process start.
    pub monitor_just_started: bool,
    /// The application's auto-build switch.
    pub auto_build: bool,
}

/// Classify one remote. Decision order matters; the first matching rule
/// wins:
///
/// 1. neither side present is a caller bug
/// 2. newly registered applications are recorded, never auto-built
/// 3. tracked but unobserved means the remote was deleted
/// 4. observed but untracked is a new remote (when auto-build is on)
/// 5. first tick after restart re-queues anything left `Waiting`
/// 6. first tick after restart fails anything left `Building`
/// 7. stale remotes (no age, or last commit beyond the threshold) idle out
/// 8. a moved sha is a change (when auto-build is on)
/// 9. otherwise nothing happened
pub fn classify(
    existing: Option<&TrackedRemote>,
    current: Option<&ObservedRemote>,
    flags: ClassifyFlags,
    now: DateTime<Utc>,
    activity_threshold: Duration,
) -> Result<BranchAction, MonitorError> {
    let (existing, current) = match (existing, current) {
        (None, None) => return Err(MonitorError::InvariantViolation),
        _ if flags.is_new_application => return Ok(BranchAction::Inactive),
        (Some(_), None) => return Ok(BranchAction::Deleted),
        (None, Some(_)) => {
            return Ok(if flags.auto_build {
                BranchAction::New
            } else {
                BranchAction::Inactive
            });
        }
        (Some(existing), Some(current)) => (existing, current),
    };

    if flags.monitor_just_started && existing.state == RemoteState::Waiting {
        return Ok(BranchAction::Change);
    }
    if flags.monitor_just_started && existing.state == RemoteState::Building {
        return Ok(BranchAction::Failed);
    }
    if !is_active(current.age, now, activity_threshold) {
        return Ok(BranchAction::Inactive);
    }
    if current.sha != existing.sha {
        return Ok(if flags.auto_build {
            BranchAction::Change
        } else {
            BranchAction::Inactive
        });
    }
    Ok(BranchAction::Done)
}

/// A remote is active when its last commit is no older than the threshold.
/// A commit exactly at the boundary counts as active; a remote with no
/// known commit time never does.
pub fn is_active(age: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold: Duration) -> bool {
    match age {
        Some(age) => age >= now - threshold,
        None => false,
    }
}

/// Whether a remote qualifies for automatic build submission: auto-build
/// enabled, an actual branch rather than a tag, and recently active.
pub fn is_buildable(
    observed: &ObservedRemote,
    auto_build: bool,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    auto_build && observed.kind == RefKind::Branch && is_active(observed.age, now, threshold)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold() -> Duration {
        Duration::days(7)
    }

    fn tracked(sha: &str, state: RemoteState) -> TrackedRemote {
        TrackedRemote {
            application_id: 1,
            remote: "main".to_string(),
            sha: sha.to_string(),
            age: Some(Utc::now()),
            seen: Utc::now(),
            state,
        }
    }

    fn observed(sha: &str, age: Option<DateTime<Utc>>) -> ObservedRemote {
        ObservedRemote {
            remote: "main".to_string(),
            kind: RefKind::Branch,
            sha: sha.to_string(),
            age,
            seen: Utc::now(),
        }
    }

    fn flags(auto_build: bool) -> ClassifyFlags {
        ClassifyFlags {
            is_new_application: false,
            monitor_just_started: false,
            auto_build,
        }
    }

    #[test]
    fn test_rule_1_both_absent_is_invariant_violation() {
        let result = classify(None, None, flags(true), Utc::now(), threshold());
        assert!(matches!(result, Err(MonitorError::InvariantViolation)));
    }

    #[test]
    fn test_rule_2_new_application_is_inactive_regardless_of_other_signals() {
        let now = Utc::now();
        let f = ClassifyFlags {
            is_new_application: true,
            monitor_just_started: true,
            auto_build: true,
        };

        // fresh, auto-buildable branch on a brand-new application
        let cur = observed("abc123", Some(now));
        let action = classify(None, Some(&cur), f, now, threshold()).unwrap();
        assert_eq!(action, BranchAction::Inactive);

        // even a tracked row left Waiting does not get re-queued
        let ex = tracked("abc123", RemoteState::Waiting);
        let action = classify(Some(&ex), Some(&cur), f, now, threshold()).unwrap();
        assert_eq!(action, BranchAction::Inactive);
    }

    #[test]
    fn test_rule_3_tracked_without_observed_is_deleted() {
        let ex = tracked("abc123", RemoteState::Done);
        let action = classify(Some(&ex), None, flags(true), Utc::now(), threshold()).unwrap();
        assert_eq!(action, BranchAction::Deleted);
    }

    #[test]
    fn test_rule_4_observed_without_tracked_is_new_when_auto_build() {
        let now = Utc::now();
        let cur = observed("abc123", Some(now));

        let action = classify(None, Some(&cur), flags(true), now, threshold()).unwrap();
        assert_eq!(action, BranchAction::New);

        let action = classify(None, Some(&cur), flags(false), now, threshold()).unwrap();
        assert_eq!(action, BranchAction::Inactive);
    }

    #[test]
    fn test_rule_5_restart_requeues_waiting_even_with_unchanged_sha() {
        let now = Utc::now();
        let ex = tracked("abc123", RemoteState::Waiting);
        let cur = observed("abc123", Some(now));
        let f = ClassifyFlags {
            is_new_application: false,
            monitor_just_started: true,
            auto_build: true,
        };
        let action = classify(Some(&ex), Some(&cur), f, now, threshold()).unwrap();
        assert_eq!(action, BranchAction::Change);
    }

    #[test]
    fn test_rule_6_restart_fails_builds_left_in_flight() {
        let now = Utc::now();
        let ex = tracked("abc123", RemoteState::Building);
        // sha moved too, but the restart rule wins
        let cur = observed("def456", Some(now));
        let f = ClassifyFlags {
            is_new_application: false,
            monitor_just_started: true,
            auto_build: true,
        };
        let action = classify(Some(&ex), Some(&cur), f, now, threshold()).unwrap();
        assert_eq!(action, BranchAction::Failed);
    }

    #[test]
    fn test_restart_rules_skip_ordinary_states() {
        let now = Utc::now();
        let ex = tracked("abc123", RemoteState::Done);
        let cur = observed("abc123", Some(now));
        let f = ClassifyFlags {
            is_new_application: false,
            monitor_just_started: true,
            auto_build: true,
        };
        let action = classify(Some(&ex), Some(&cur), f, now, threshold()).unwrap();
        assert_eq!(action, BranchAction::Done);
    }

    #[test]
    fn test_rule_7_stale_branch_is_inactive() {
        let now = Utc::now();
        let ex = tracked("abc123", RemoteState::Done);
        let cur = observed("def456", Some(now - Duration::days(30)));
        let action = classify(Some(&ex), Some(&cur), flags(true), now, threshold()).unwrap();
        assert_eq!(action, BranchAction::Inactive);
    }

    #[test]
    fn test_rule_7_missing_age_is_inactive() {
        let now = Utc::now();
        let ex = tracked("abc123", RemoteState::Done);
        let cur = observed("def456", None);
        let action = classify(Some(&ex), Some(&cur), flags(true), now, threshold()).unwrap();
        assert_eq!(action, BranchAction::Inactive);
    }

    #[test]
    fn test_rule_8_moved_sha_is_change_when_auto_build() {
        let now = Utc::now();
        let ex = tracked("abc123", RemoteState::Done);
        let cur = observed("def456", Some(now));

        let action = classify(Some(&ex), Some(&cur), flags(true), now, threshold()).unwrap();
        assert_eq!(action, BranchAction::Change);

        let action = classify(Some(&ex), Some(&cur), flags(false), now, threshold()).unwrap();
        assert_eq!(action, BranchAction::Inactive);
    }

    #[test]
    fn test_rule_9_unchanged_sha_is_done() {
        let now = Utc::now();
        let ex = tracked("abc123", RemoteState::Done);
        let cur = observed("abc123", Some(now));
        let action = classify(Some(&ex), Some(&cur), flags(true), now, threshold()).unwrap();
        assert_eq!(action, BranchAction::Done);
    }

    #[test]
    fn test_activity_boundary_instant_is_active() {
        let now = Utc::now();
        let boundary = now - threshold();
        assert!(is_active(Some(boundary), now, threshold()));
        assert!(!is_active(
            Some(boundary - Duration::seconds(1)),
            now,
            threshold()
        ));
        assert!(!is_active(None, now, threshold()));
    }

    #[test]
    fn test_buildable_requires_branch_kind() {
        let now = Utc::now();
        let branch = observed("abc123", Some(now));
        assert!(is_buildable(&branch, true, now, threshold()));
        assert!(!is_buildable(&branch, false, now, threshold()));

        let tag = ObservedRemote {
            kind: RefKind::Tag,
            ..branch.clone()
        };
        assert!(!is_buildable(&tag, true, now, threshold()));
    }

    #[test]
    fn test_buildable_requires_recent_activity() {
        let now = Utc::now();
        let stale = observed("abc123", Some(now - Duration::days(8)));
        assert!(!is_buildable(&stale, true, now, threshold()));

        let unknown = observed("abc123", None);
        assert!(!is_buildable(&unknown, true, now, threshold()));
    }
}
