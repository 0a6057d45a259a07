//! Scanning of autogenerated `//testing/buildbot`-style suite definition files.
//!
//! Each file in the buildbot directory is a JSON object keyed by CI builder
//! name, plus a sentinel key marking it as autogenerated. Files without the
//! sentinel (hand-maintained configs, unrelated JSON) are ignored. The only
//! question answered here is: which CI builders run a given telemetry suite?

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use walkdir::WalkDir;

/// Sentinel top-level key present in every autogenerated buildbot JSON file.
pub const AUTOGENERATED_KEY: &str = "AAAAA1 AUTOGENERATED FILE DO NOT EDIT";

/// Isolate names under which the GPU telemetry suites run.
pub const TELEMETRY_ISOLATES: &[&str] = &[
    "fuchsia_telemetry_gpu_integration_test",
    "telemetry_gpu_integration_test",
];

/// Test-definition record for one CI builder, as found in a buildbot file.
///
/// Only the `isolated_scripts` section matters for suite filtering; every
/// other section (`gtest_tests`, dimensions, etc.) is ignored on parse.
#[derive(Debug, Default, Deserialize)]
pub struct TestSpec {
    #[serde(default)]
    pub isolated_scripts: Vec<IsolatedScript>,
}

/// One entry of an `isolated_scripts` list.
#[derive(Debug, Default, Deserialize)]
pub struct IsolatedScript {
    #[serde(default)]
    pub isolate_name: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Returns the CI builders in `buildbot_dir` that run `suite` under one of
/// the telemetry isolates.
///
/// The scan is non-recursive and only considers `*.json` files carrying the
/// autogenerated sentinel. Compile-only builders (name contains `Builder`)
/// and comment keys (name contains `AAAA`) are dropped. Files or records
/// that fail to parse are skipped with a warning — an empty result is a
/// valid result, not an error.
///
/// # Errors
/// Only if `buildbot_dir` itself is missing or not a directory.
pub fn relevant_ci_builders(suite: &str, buildbot_dir: &Path) -> Result<BTreeSet<String>> {
    if !buildbot_dir.is_dir() {
        bail!("buildbot directory not found: {}", buildbot_dir.display());
    }

    let mut builders = BTreeSet::new();

    for entry in WalkDir::new(buildbot_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|s| s.to_str()) != Some("json")
        {
            continue;
        }

        let top = match load_suite_file(path) {
            Ok(Some(map)) => map,
            Ok(None) => continue, // no sentinel: not a builder definition file
            Err(e) => {
                eprintln!("warning: skipping {}: {}", path.display(), e);
                continue;
            }
        };

        for (builder, record) in top {
            // Compile-only builders and autogenerated comment keys.
            if builder.contains("Builder") || builder.contains("AAAA") {
                continue;
            }
            let spec: TestSpec = match serde_json::from_value(record) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!(
                        "warning: skipping malformed record for `{}` in {}: {}",
                        builder,
                        path.display(),
                        e
                    );
                    continue;
                }
            };
            if runs_suite(suite, &spec.isolated_scripts) {
                builders.insert(builder);
            }
        }
    }

    Ok(builders)
}

/// Parses one buildbot JSON file. `Ok(None)` means the file parsed but does
/// not carry the autogenerated sentinel and should be ignored.
fn load_suite_file(path: &Path) -> Result<Option<serde_json::Map<String, Value>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let value: Value = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))?;
    let Value::Object(map) = value else {
        bail!("top level of {} is not an object", path.display());
    };
    if !map.contains_key(AUTOGENERATED_KEY) {
        return Ok(None);
    }
    Ok(Some(map))
}

/// True if any script runs a telemetry isolate with `suite` in its args.
fn runs_suite(suite: &str, scripts: &[IsolatedScript]) -> bool {
    scripts.iter().any(|s| {
        s.isolate_name
            .as_deref()
            .is_some_and(|name| TELEMETRY_ISOLATES.contains(&name))
            && s.args.iter().any(|a| a == suite)
    })
}
