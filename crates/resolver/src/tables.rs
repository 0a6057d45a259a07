//! Static override and exclusion tables for mirror resolution.
//!
//! Overrides are declared try-builder → CI-builder-list (one try builder
//! usually mirrors several CI builders) and inverted at construction into a
//! CI → try map, so the repeated try names appear exactly once in the
//! source table.

use std::collections::{HashMap, HashSet};

/// CI builders that only exist as trybot mirrors — a live query for them
/// would return nothing useful, so the mapping is pinned here.
const STATIC_TRY_MIRRORS: &[(&str, &[&str])] = &[
    // chromium.gpu.fyi
    ("android_angle_rel_ng", &["ANGLE GPU Android Release (Nexus 5X)"]),
    (
        "android_optional_gpu_tests_rel",
        &["Optional Android Release (Nexus 5X)"],
    ),
    (
        "linux-angle-rel",
        &[
            "ANGLE GPU Linux Release (Intel HD 630)",
            "ANGLE GPU Linux Release (NVIDIA)",
        ],
    ),
    (
        "linux_optional_gpu_tests_rel",
        &[
            "Optional Linux Release (Intel HD 630)",
            "Optional Linux Release (NVIDIA)",
        ],
    ),
    (
        "mac-angle-rel",
        &[
            "ANGLE GPU Mac Release (Intel)",
            "ANGLE GPU Mac Retina Release (AMD)",
            "ANGLE GPU Mac Retina Release (NVIDIA)",
        ],
    ),
    (
        "mac_optional_gpu_tests_rel",
        &[
            "Optional Mac Release (Intel)",
            "Optional Mac Retina Release (AMD)",
            "Optional Mac Retina Release (NVIDIA)",
        ],
    ),
    ("win-angle-rel-32", &["Win7 ANGLE Tryserver (AMD)"]),
    (
        "win-angle-rel-64",
        &[
            "ANGLE GPU Win10 x64 Release (Intel HD 630)",
            "ANGLE GPU Win10 x64 Release (NVIDIA)",
        ],
    ),
    (
        "win_optional_gpu_tests_rel",
        &[
            "Optional Win10 x64 Release (Intel HD 630)",
            "Optional Win10 x64 Release (NVIDIA)",
        ],
    ),
];

/// CI builders outside the Chromium Buildbucket project. They show up in
/// the //testing/buildbot files but use different recipes, so they have no
/// trybot mirror by design.
const NON_CHROMIUM_BUILDERS: &[&str] = &[
    "Win V8 FYI Release (NVIDIA)",
    "Mac V8 FYI Release (Intel)",
    "Linux V8 FYI Release - pointer compression (NVIDIA)",
    "Linux V8 FYI Release (NVIDIA)",
    "Android V8 FYI Release (Nexus 5X)",
];

/// Lookup tables consulted before any live Buildbucket query.
#[derive(Debug, Clone)]
pub struct MirrorTables {
    ci_to_try: HashMap<String, String>,
    non_chromium: HashSet<String>,
}

impl MirrorTables {
    /// Builds tables from try → CI override lists and an exclusion set.
    pub fn new<I, J>(overrides: I, non_chromium: J) -> Self
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
        J: IntoIterator<Item = String>,
    {
        let mut ci_to_try = HashMap::new();
        for (try_builder, ci_builders) in overrides {
            for ci in ci_builders {
                ci_to_try.insert(ci, try_builder.clone());
            }
        }
        Self {
            ci_to_try,
            non_chromium: non_chromium.into_iter().collect(),
        }
    }

    /// The tables shipped for the Chromium GPU waterfalls.
    pub fn chromium_defaults() -> Self {
        Self::new(
            STATIC_TRY_MIRRORS.iter().map(|(try_builder, ci_builders)| {
                (
                    (*try_builder).to_string(),
                    ci_builders.iter().map(|c| (*c).to_string()).collect(),
                )
            }),
            NON_CHROMIUM_BUILDERS.iter().map(|b| (*b).to_string()),
        )
    }

    /// Empty tables: every builder goes through the live query tier.
    pub fn empty() -> Self {
        Self::new(std::iter::empty(), std::iter::empty())
    }

    pub fn is_non_chromium(&self, ci_builder: &str) -> bool {
        self.non_chromium.contains(ci_builder)
    }

    pub fn static_mirror(&self, ci_builder: &str) -> Option<&str> {
        self.ci_to_try.get(ci_builder).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_inverted_at_construction() {
        let tables = MirrorTables::chromium_defaults();
        assert_eq!(
            tables.static_mirror("ANGLE GPU Linux Release (NVIDIA)"),
            Some("linux-angle-rel")
        );
        assert_eq!(
            tables.static_mirror("ANGLE GPU Linux Release (Intel HD 630)"),
            Some("linux-angle-rel")
        );
    }

    #[test]
    fn test_non_chromium_membership() {
        let tables = MirrorTables::chromium_defaults();
        assert!(tables.is_non_chromium("Linux V8 FYI Release (NVIDIA)"));
        assert!(!tables.is_non_chromium("Linux Release (NVIDIA)"));
    }

    #[test]
    fn test_empty_tables() {
        let tables = MirrorTables::empty();
        assert!(tables.static_mirror("anything").is_none());
        assert!(!tables.is_non_chromium("anything"));
    }
}
