//! Owner records embedded in OS account comments.
//!
//! A shared account may be used by several nodes of the same application.
//! Its comment lists them as `<prefix>|<account>|<node1,node2,...>|<app id>`,
//! and the account is only deleted once the last node lets go of it.
//! Every read-modify-write of a comment happens under the account's named lock.

use crate::config::APPLICATION_COMMENT_PREFIX;
use crate::error::{HostingError, Result};
use crate::ids::ApplicationId;

const SEPARATOR: char = '|';
const NODE_SEPARATOR: char = ',';

/// Result of an ownership check on a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    /// Removing the node would leave no owners behind.
    pub is_last_node: bool,
}

/// Build a comment for a freshly created account.
pub fn create_comment(account_name: &str, node_ids: &str, application_id: &str) -> String {
    format!("{APPLICATION_COMMENT_PREFIX}{SEPARATOR}{account_name}{SEPARATOR}{node_ids}{SEPARATOR}{application_id}")
}

fn split(comment: &str) -> Option<[&str; 4]> {
    if !comment.starts_with(APPLICATION_COMMENT_PREFIX) {
        return None;
    }
    let parts: Vec<&str> = comment.split(SEPARATOR).collect();
    match parts.as_slice() {
        [prefix, account, nodes, app] if *prefix == APPLICATION_COMMENT_PREFIX => {
            Some([*prefix, *account, *nodes, *app])
        }
        _ => None,
    }
}

fn node_list(nodes: &str) -> Vec<&str> {
    nodes.split(NODE_SEPARATOR).filter(|n| !n.is_empty()).collect()
}

fn malformed(comment: &str) -> HostingError {
    tracing::error!(comment = %comment, "account comment has an invalid format, stale comments need manual cleanup");
    HostingError::invalid_state("application account comment", comment)
}

/// Add `node_id` to the owner list of `comment`.
///
/// # Panics
///
/// Panics if the comment has no owners, belongs to a different application,
/// or already lists `node_id` for a non-system application.
pub fn add_node_to_comment(comment: &str, node_id: &str, application_id: &str) -> Result<String> {
    let [_, account, nodes, app] = split(comment).ok_or_else(|| malformed(comment))?;

    let node_ids = node_list(nodes);
    assert!(!node_ids.is_empty(), "node ids in comment '{comment}' cannot be empty");
    assert_eq!(
        app, application_id,
        "application id {application_id} does not match comment '{comment}'"
    );

    let present = node_ids.contains(&node_id);
    let is_system = application_id.eq_ignore_ascii_case(&ApplicationId::system().to_string());
    assert!(
        is_system || !present,
        "node id {node_id} cannot already be in comment '{comment}'"
    );

    if present {
        return Ok(comment.to_string());
    }
    Ok(create_comment(account, &format!("{nodes}{NODE_SEPARATOR}{node_id}"), application_id))
}

/// Remove `node_id` from the owner list of `comment`.
///
/// With `remove_all`, every entry equal to `node_id` is dropped; otherwise
/// exactly one entry is.
///
/// # Panics
///
/// Panics if fewer than two owners remain before removal (the last owner
/// deletes the account instead), or if `node_id` is absent and `remove_all`
/// is false.
pub fn remove_node_from_comment(comment: &str, node_id: &str, remove_all: bool) -> Result<String> {
    let [_, account, nodes, app] = split(comment).ok_or_else(|| malformed(comment))?;

    let mut node_ids = node_list(nodes);
    assert!(
        node_ids.len() >= 2,
        "node ids in comment '{comment}' cannot be fewer than 2"
    );

    if remove_all {
        node_ids.retain(|n| *n != node_id);
    } else {
        let index = node_ids
            .iter()
            .position(|n| *n == node_id)
            .unwrap_or_else(|| panic!("node id {node_id} should be in comment '{comment}'"));
        node_ids.remove(index);
    }

    Ok(create_comment(account, &node_ids.join(","), app))
}

/// Check whether `comment` marks the account as owned by `node_id` and
/// `application_id`.
///
/// An empty `node_id` matches any node; an empty `application_id` matches
/// any application. Comments without the application prefix are never owned.
pub fn is_principal_owned(
    comment: &str,
    node_id: &str,
    application_id: &str,
    remove_all: bool,
) -> Option<Ownership> {
    let [_, _, nodes, app] = split(comment)?;

    let mut matched = node_id.is_empty();
    let mut is_last_node = true;
    if !node_id.is_empty() {
        let node_ids = node_list(nodes);
        assert!(!node_ids.is_empty(), "node ids in comment '{comment}' cannot be empty");

        for candidate in &node_ids {
            if *candidate == node_id {
                matched = true;
                if !remove_all {
                    is_last_node = node_ids.len() == 1;
                    break;
                }
            } else {
                is_last_node = false;
            }
        }
    }

    if matched && !application_id.is_empty() {
        matched = app == application_id;
    }

    matched.then_some(Ownership { is_last_node })
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = "CalcApp_App3";

    #[test]
    fn test_create_comment_format() {
        assert_eq!(
            create_comment("svcuser", "N1", APP),
            "WinFabApplication|svcuser|N1|CalcApp_App3"
        );
    }

    #[test]
    fn test_add_then_remove_restores_owners() {
        let original = create_comment("svcuser", "N1,N2", APP);
        let added = add_node_to_comment(&original, "N3", APP).unwrap();
        assert_eq!(added, create_comment("svcuser", "N1,N2,N3", APP));

        let removed = remove_node_from_comment(&added, "N3", false).unwrap();
        assert_eq!(removed, original);
    }

    #[test]
    fn test_malformed_comment_is_invalid_state() {
        let err = add_node_to_comment("WinFabApplication|only|three", "N1", APP).unwrap_err();
        assert!(matches!(err, HostingError::InvalidState { .. }));

        let err = remove_node_from_comment("some other comment", "N1", false).unwrap_err();
        assert!(matches!(err, HostingError::InvalidState { .. }));
    }

    #[test]
    #[should_panic(expected = "does not match")]
    fn test_add_node_for_other_application_panics() {
        let comment = create_comment("svcuser", "N1", "Other_App1");
        let _ = add_node_to_comment(&comment, "N2", APP);
    }

    #[test]
    #[should_panic(expected = "cannot already be in comment")]
    fn test_add_existing_node_panics() {
        let comment = create_comment("svcuser", "N1", APP);
        let _ = add_node_to_comment(&comment, "N1", APP);
    }

    #[test]
    fn test_system_application_tolerates_existing_node() {
        let system = ApplicationId::system().to_string();
        let comment = create_comment("fssuser", "N1", &system);
        assert_eq!(add_node_to_comment(&comment, "N1", &system).unwrap(), comment);
    }

    #[test]
    #[should_panic(expected = "cannot be fewer than 2")]
    fn test_remove_last_owner_panics() {
        let comment = create_comment("svcuser", "N1", APP);
        let _ = remove_node_from_comment(&comment, "N1", false);
    }

    #[test]
    fn test_remove_all_drops_duplicates() {
        let comment = create_comment("svcuser", "N1,N2,N1", APP);
        let removed = remove_node_from_comment(&comment, "N1", true).unwrap();
        assert_eq!(removed, create_comment("svcuser", "N2", APP));
    }

    #[test]
    fn test_is_principal_owned_last_node() {
        let single = create_comment("svcuser", "N1", APP);
        assert_eq!(
            is_principal_owned(&single, "N1", APP, false),
            Some(Ownership { is_last_node: true })
        );

        let shared = create_comment("svcuser", "N1,N2", APP);
        assert_eq!(
            is_principal_owned(&shared, "N2", APP, false),
            Some(Ownership { is_last_node: false })
        );
    }

    #[test]
    fn test_is_principal_owned_mismatches() {
        let comment = create_comment("svcuser", "N1", APP);
        assert_eq!(is_principal_owned(&comment, "N9", APP, false), None);
        assert_eq!(is_principal_owned(&comment, "N1", "Other_App1", false), None);
        assert_eq!(is_principal_owned("local admin account", "N1", APP, false), None);
    }

    #[test]
    fn test_is_principal_owned_wildcards() {
        let comment = create_comment("svcuser", "N1,N2", APP);
        assert!(is_principal_owned(&comment, "", APP, false).is_some());
        assert!(is_principal_owned(&comment, "N2", "", false).is_some());
    }

    #[test]
    fn test_is_principal_owned_remove_all() {
        let comment = create_comment("svcuser", "N1,N1", APP);
        assert_eq!(
            is_principal_owned(&comment, "N1", "", true),
            Some(Ownership { is_last_node: true })
        );

        let mixed = create_comment("svcuser", "N1,N2,N1", APP);
        assert_eq!(
            is_principal_owned(&mixed, "N1", "", true),
            Some(Ownership { is_last_node: false })
        );
    }
}
