//! App-ID replacement list: revokes compromised app keys and canonicalises
//! replacement keys back to the original, applied to a just-verified
//! (AppId, PackageId) pair.
//!
//! Ported from `original_source/src/sandstorm/appid-replacements.c++`. The
//! rule list is organised into events (one revocation plus an optional
//! replacement mapping), not directly into rules, which is why revocation
//! and replacement are two separate linear passes rather than one.

use crate::ids::{AppId, PackageId};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AppIdReplacement {
    pub original: AppId,
    pub replacement: Option<AppId>,
    /// If present, `original` is revoked except for packages in this list.
    pub revoke_except_package_ids: Option<Vec<PackageId>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReplacementError {
    #[error("package is signed with an app key that has been revoked")]
    Revoked,
}

/// Applies the replacement list to `(app_id, package_id)` in place.
///
/// Two passes, exactly mirroring the C++ original:
/// 1. If `app_id` matches some rule's `original` and that rule carries a
///    `revoke_except_package_ids` list that does not include `package_id`,
///    the package is rejected outright.
/// 2. Otherwise, if `app_id` matches some rule's `replacement`, it is
///    rewritten to that rule's `original`. This repeats to a fixed point:
///    a second rule may target the *previous* rule's `original` as its own
///    `replacement`, so the walk must re-scan from the top after each hit
///    rather than following a single hop.
///
/// Rules are scanned in the order given — this ordering is not documented
/// anywhere upstream but is load-bearing when two rules share the same
/// `original`, so callers must pass the list in its canonical declaration
/// order, never a map keyed by `original`.
pub fn apply_appid_replacements(
    app_id: &mut AppId,
    package_id: &PackageId,
    replacements: &[AppIdReplacement],
) -> Result<(), ReplacementError> {
    // Pass 1: revocation check.
    for item in replacements {
        if *app_id == item.original {
            if let Some(allowed) = &item.revoke_except_package_ids {
                if !allowed.contains(package_id) {
                    return Err(ReplacementError::Revoked);
                }
            }
        }
    }

    // Pass 2: replacement walk to a fixed point.
    loop {
        let mut replaced = false;
        for item in replacements {
            if Some(*app_id) == item.replacement {
                *app_id = item.original;
                replaced = true;
                break;
            }
        }
        if !replaced {
            break;
        }
    }

    Ok(())
}

/// Resolves the public key that should be used to verify a package signed
/// under `app_id`, walking the replacement chain forward (replacement →
/// original) without the revocation check — used when canonicalising a key
/// for display, not for signature verification gating.
pub fn public_key_for_app(app_id: &AppId, replacements: &[AppIdReplacement]) -> AppId {
    let mut current = *app_id;
    loop {
        let mut matched = None;
        for item in replacements {
            if item.original == current {
                if let Some(replacement) = item.replacement {
                    matched = Some(replacement);
                    break;
                }
            }
        }
        match matched {
            Some(next) => current = next,
            None => return current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(byte: u8) -> AppId {
        AppId::from_bytes([byte; 32])
    }

    fn pkg(byte: u8) -> PackageId {
        PackageId::from_bytes([byte; 16])
    }

    #[test]
    fn revoked_key_without_allowlist_is_rejected() {
        let rules = vec![AppIdReplacement {
            original: app(1),
            replacement: None,
            revoke_except_package_ids: Some(vec![]),
        }];
        let mut id = app(1);
        assert_eq!(
            apply_appid_replacements(&mut id, &pkg(9), &rules),
            Err(ReplacementError::Revoked)
        );
    }

    #[test]
    fn revoked_key_allowlisted_package_passes_through() {
        let rules = vec![AppIdReplacement {
            original: app(1),
            replacement: None,
            revoke_except_package_ids: Some(vec![pkg(9)]),
        }];
        let mut id = app(1);
        assert!(apply_appid_replacements(&mut id, &pkg(9), &rules).is_ok());
        assert_eq!(id, app(1));
    }

    #[test]
    fn replacement_key_canonicalises_to_original() {
        let rules = vec![AppIdReplacement {
            original: app(1),
            replacement: Some(app(2)),
            revoke_except_package_ids: None,
        }];
        let mut id = app(2);
        apply_appid_replacements(&mut id, &pkg(0), &rules).unwrap();
        assert_eq!(id, app(1));
    }

    #[test]
    fn chained_replacements_walk_to_fixed_point() {
        // app(3) was replaced by app(2), which was itself later replaced by
        // app(1). A second rule's `original` is the *previous* replacement's
        // `original` (app 2), not app 3 — the walk must re-scan to apply it.
        let rules = vec![
            AppIdReplacement {
                original: app(2),
                replacement: Some(app(3)),
                revoke_except_package_ids: None,
            },
            AppIdReplacement {
                original: app(1),
                replacement: Some(app(2)),
                revoke_except_package_ids: None,
            },
        ];
        let mut id = app(3);
        apply_appid_replacements(&mut id, &pkg(0), &rules).unwrap();
        assert_eq!(id, app(1));
    }

    #[test]
    fn idempotent_application() {
        let rules = vec![AppIdReplacement {
            original: app(1),
            replacement: Some(app(2)),
            revoke_except_package_ids: None,
        }];
        let mut once = app(2);
        apply_appid_replacements(&mut once, &pkg(0), &rules).unwrap();
        let mut twice = once;
        apply_appid_replacements(&mut twice, &pkg(0), &rules).unwrap();
        assert_eq!(once, twice);
    }
}
