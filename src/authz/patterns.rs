//! Pure permission-code matching.
//!
//! Codes have the shape `module:action` where `action` may itself contain
//! colons (`inspection:read:own`). Two wildcard forms exist: the module
//! wildcard `module:*` and the global wildcard `*` (also written `*:*`).

use std::collections::HashSet;

use uuid::Uuid;

use crate::models::rbac::Permission;

pub const GLOBAL_WILDCARD: &str = "*";
pub const GLOBAL_WILDCARD_PAIR: &str = "*:*";

pub fn is_global_wildcard(code: &str) -> bool {
    code == GLOBAL_WILDCARD || code == GLOBAL_WILDCARD_PAIR
}

/// Returns the module of a `module:*` code.
pub fn module_wildcard(code: &str) -> Option<&str> {
    code.strip_suffix(":*").filter(|module| !module.is_empty() && *module != "*")
}

pub fn is_wildcard(code: &str) -> bool {
    is_global_wildcard(code) || module_wildcard(code).is_some()
}

/// Module part of a code: everything before the first `:`.
pub fn module_of(code: &str) -> &str {
    code.split_once(':').map(|(module, _)| module).unwrap_or(code)
}

/// Splits a literal code into `(module, action)`.
pub fn split_code(code: &str) -> Option<(&str, &str)> {
    let (module, action) = code.split_once(':')?;
    if module.is_empty() || action.is_empty() {
        return None;
    }
    Some((module, action))
}

/// Checks a required code against an effective set: exact match, then the
/// module wildcard of the required code, then the global wildcard.
pub fn has_permission<S: AsRef<str>>(set: &[S], required: &str) -> bool {
    if set.iter().any(|code| code.as_ref() == required) {
        return true;
    }

    let module_pattern = format!("{}:*", module_of(required));
    if set.iter().any(|code| code.as_ref() == module_pattern) {
        return true;
    }

    set.iter().any(|code| is_global_wildcard(code.as_ref()))
}

/// Whether `pattern` grants (or, for a deny, removes) `code`.
pub fn covers(pattern: &str, code: &str) -> bool {
    if is_global_wildcard(pattern) || pattern == code {
        return true;
    }
    match module_wildcard(pattern) {
        Some(module) => module_of(code) == module,
        None => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternResolution {
    /// Matched permission ids in first-seen order, without duplicates.
    pub permission_ids: Vec<Uuid>,
    /// Exact-code patterns with no active catalog entry.
    pub unmatched: Vec<String>,
}

/// Expands role-setup patterns against a catalog snapshot. Inactive entries
/// never match. Unmatched exact codes are reported, not treated as errors.
pub fn resolve_permission_patterns<S: AsRef<str>>(patterns: &[S], catalog: &[Permission]) -> PatternResolution {
    let mut resolution = PatternResolution::default();
    let mut seen = HashSet::new();

    for pattern in patterns {
        let pattern = pattern.as_ref().trim();
        if pattern.is_empty() {
            continue;
        }

        let matched: Vec<&Permission> = if is_global_wildcard(pattern) {
            catalog.iter().filter(|p| p.is_active).collect()
        } else if let Some(module) = module_wildcard(pattern) {
            catalog.iter().filter(|p| p.is_active && p.module == module).collect()
        } else {
            catalog.iter().filter(|p| p.is_active && p.code == pattern).collect()
        };

        if matched.is_empty() && !is_wildcard(pattern) {
            resolution.unmatched.push(pattern.to_string());
            continue;
        }

        for permission in matched {
            if seen.insert(permission.id) {
                resolution.permission_ids.push(permission.id);
            }
        }
    }

    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    fn permission(code: &str, active: bool) -> Permission {
        let (module, action) = split_code(code).unwrap();
        let now = Utc::now();
        Permission {
            id: Uuid::new_v4(),
            code: code.to_string(),
            name: code.to_string(),
            description: None,
            module: module.to_string(),
            action: action.to_string(),
            scope: "factory".to_string(),
            is_active: active,
            created_at: now,
            updated_at: now,
        }
    }

    fn catalog() -> Vec<Permission> {
        vec![
            permission("equipment:read", true),
            permission("equipment:create", true),
            permission("equipment:delete", true),
            permission("inspection:read", true),
            permission("inspection:read:own", true),
            permission("issue:create", true),
            permission("report:export", false),
        ]
    }

    #[test]
    fn has_permission_truth_table() {
        let required = "equipment:read";
        let cases: &[(&[&str], bool)] = &[
            (&["equipment:read"], true),
            (&["equipment:*"], true),
            (&["*:*"], true),
            (&["*"], true),
            (&["equipment:create"], false),
            (&["inspection:*"], false),
            (&["equipment"], false),
            (&["equipment:read:own"], false),
            (&[], false),
        ];
        for (set, expected) in cases {
            assert_eq!(has_permission(set, required), *expected, "set {:?}", set);
        }
    }

    #[test]
    fn module_wildcard_uses_prefix_before_first_colon() {
        assert!(has_permission(&["inspection:*"], "inspection:read:own"));
        assert!(!has_permission(&["inspection:read:*"], "inspection:read:own"));
    }

    #[test]
    fn module_wildcard_parsing() {
        assert_eq!(module_wildcard("equipment:*"), Some("equipment"));
        assert_eq!(module_wildcard("*:*"), None);
        assert_eq!(module_wildcard(":*"), None);
        assert_eq!(module_wildcard("equipment:read"), None);
    }

    #[test]
    fn covers_matches_wildcards_and_literals() {
        assert!(covers("*", "issue:audit"));
        assert!(covers("issue:*", "issue:audit"));
        assert!(covers("issue:audit", "issue:audit"));
        assert!(!covers("equipment:*", "issue:audit"));
        assert!(!covers("issue:read", "issue:audit"));
    }

    #[test]
    fn global_pattern_selects_every_active_permission() {
        let catalog = catalog();
        let active = catalog.iter().filter(|p| p.is_active).count();
        let resolution = resolve_permission_patterns(&["*"], &catalog);
        assert_eq!(resolution.permission_ids.len(), active);
        assert!(resolution.unmatched.is_empty());
    }

    #[test]
    fn module_pattern_selects_module() {
        let catalog = catalog();
        let resolution = resolve_permission_patterns(&["equipment:*"], &catalog);
        assert_eq!(resolution.permission_ids.len(), 3);
    }

    #[test]
    fn unmatched_exact_codes_are_reported() {
        let catalog = catalog();
        let resolution = resolve_permission_patterns(&["equipment:read", "equipmnt:read", "report:export"], &catalog);
        assert_eq!(resolution.permission_ids, vec![catalog[0].id]);
        assert_eq!(resolution.unmatched, vec!["equipmnt:read".to_string(), "report:export".to_string()]);
    }

    #[test]
    fn overlapping_patterns_do_not_duplicate() {
        let catalog = catalog();
        let resolution = resolve_permission_patterns(&["equipment:read", "equipment:*", "*"], &catalog);
        assert_eq!(resolution.permission_ids.len(), 6);
        assert_eq!(resolution.permission_ids[0], catalog[0].id);
    }

    fn code_strategy() -> impl Strategy<Value = String> {
        ("[a-z]{1,8}", "[a-z]{1,8}(:own)?").prop_map(|(m, a)| format!("{m}:{a}"))
    }

    proptest! {
        #[test]
        fn global_wildcard_always_grants(required in code_strategy(), extra in proptest::collection::vec(code_strategy(), 0..5)) {
            let mut set = extra.clone();
            set.push("*".to_string());
            prop_assert!(has_permission(&set, &required));
            set.pop();
            set.push("*:*".to_string());
            prop_assert!(has_permission(&set, &required));
        }

        #[test]
        fn module_wildcard_grants_exactly_its_module(required in code_strategy(), other in "[a-z]{1,8}") {
            let module = module_of(&required).to_string();
            let own = format!("{module}:*");
            prop_assert!(has_permission(&[own.as_str()], &required));
            let foreign = format!("{other}:*");
            prop_assert_eq!(has_permission(&[foreign.as_str()], &required), other == module);
        }

        #[test]
        fn literal_set_grants_only_members(set in proptest::collection::vec(code_strategy(), 0..8), required in code_strategy()) {
            prop_assert_eq!(has_permission(&set, &required), set.contains(&required));
        }

        #[test]
        fn resolution_never_yields_inactive_or_duplicates(patterns in proptest::collection::vec(
            prop_oneof![
                Just("*".to_string()),
                Just("equipment:*".to_string()),
                Just("report:*".to_string()),
                Just("equipment:read".to_string()),
                Just("report:export".to_string()),
                code_strategy(),
            ],
            0..8,
        )) {
            let catalog = catalog();
            let resolution = resolve_permission_patterns(&patterns, &catalog);
            let unique: HashSet<_> = resolution.permission_ids.iter().collect();
            prop_assert_eq!(unique.len(), resolution.permission_ids.len());
            for id in &resolution.permission_ids {
                let entry = catalog.iter().find(|p| &p.id == id).unwrap();
                prop_assert!(entry.is_active);
            }
            for pattern in &resolution.unmatched {
                prop_assert!(!is_wildcard(pattern));
                prop_assert!(!catalog.iter().any(|p| p.is_active && &p.code == pattern));
            }
        }
    }
}
