//! Subprocess client for the Buildbucket `bb` CLI.
//!
//! Fetching a builder's most recent build is a two-step pipeline:
//! 1. `bb ls -id -1 -status ended chromium/ci/<builder>` — newest ended
//!    build ID on stdout.
//! 2. `bb get -A -json` with that ID on stdin — full build record as JSON.
//!
//! Authentication (`bb auth-info`) is checked at most once per process,
//! before the first live query, and the outcome is cached in a `OnceLock`
//! so concurrent first callers cannot race a second check.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

/// Errors from `bb` invocations and build-record parsing.
#[derive(Debug, thiserror::Error)]
pub enum BbError {
    #[error("bb authentication failed: {0}")]
    NotAuthenticated(String),
    #[error("failed to run `{tool}` for builder `{builder}`: {source}")]
    Spawn {
        tool: String,
        builder: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bb produced no output for builder `{0}`")]
    NoOutput(String),
    #[error("malformed bb response for builder `{builder}`: {detail}")]
    Malformed { builder: String, detail: String },
}

/// Build record as returned by `bb get -json`, reduced to the fields the
/// mirror resolution cares about. Every level defaults to empty so a build
/// without output properties parses as "no mirrors" rather than failing.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct BuildRecord {
    #[serde(default)]
    pub output: BuildOutput,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct BuildOutput {
    #[serde(default)]
    pub properties: BuildProperties,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct BuildProperties {
    #[serde(default)]
    pub mirrored_builders: Vec<String>,
}

/// Extracts try-builder names from a build record's mirror list.
///
/// Buildbucket reports mirrors as `"<group>:<builder>"` (e.g.
/// `tryserver.chromium.linux:my-try-builder`); only the builder part is
/// kept. An entry without exactly one `:` separator is malformed.
pub fn mirrored_try_builders(
    ci_builder: &str,
    record: &BuildRecord,
) -> Result<BTreeSet<String>, BbError> {
    let mut names = BTreeSet::new();
    for entry in &record.output.properties.mirrored_builders {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 2 {
            return Err(BbError::Malformed {
                builder: ci_builder.to_string(),
                detail: format!("mirror entry `{entry}` is not `<group>:<builder>`"),
            });
        }
        names.insert(parts[1].to_string());
    }
    Ok(names)
}

/// Seam over the live `bb` tool so the resolver (and its tests) can swap in
/// a scripted querier.
pub trait BuildQuerier: Send + Sync {
    /// Verifies the tool is logged in. Must be cheap after the first call.
    fn ensure_authenticated(&self) -> Result<(), BbError>;

    /// Fetches the most recent ended build record for a CI builder.
    fn latest_build(&self, ci_builder: &str) -> Result<BuildRecord, BbError>;
}

/// Live `bb` client. The tool path defaults to `bb` on `$PATH` and can be
/// overridden with the `TRY_MIRRORS_BB` environment variable.
pub struct BbClient {
    tool: String,
    auth: OnceLock<Option<String>>,
}

impl BbClient {
    pub fn from_env() -> Self {
        let tool = std::env::var("TRY_MIRRORS_BB").unwrap_or_else(|_| "bb".to_string());
        Self::with_tool(tool)
    }

    pub fn with_tool(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            auth: OnceLock::new(),
        }
    }

    fn run_ls(&self, ci_builder: &str) -> Result<String, BbError> {
        let out = Command::new(&self.tool)
            .args(["ls", "-id", "-1", "-status", "ended"])
            .arg(format!("chromium/ci/{ci_builder}"))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| BbError::Spawn {
                tool: self.tool.clone(),
                builder: ci_builder.to_string(),
                source: e,
            })?;
        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if id.is_empty() {
            return Err(BbError::NoOutput(ci_builder.to_string()));
        }
        Ok(id)
    }

    fn run_get(&self, ci_builder: &str, build_id: &str) -> Result<Vec<u8>, BbError> {
        let spawn_err = |e| BbError::Spawn {
            tool: self.tool.clone(),
            builder: ci_builder.to_string(),
            source: e,
        };
        let mut child = Command::new(&self.tool)
            .args(["get", "-A", "-json"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(spawn_err)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(build_id.as_bytes())
                .and_then(|()| stdin.write_all(b"\n"))
                .map_err(spawn_err)?;
        }
        let out = child.wait_with_output().map_err(spawn_err)?;
        if out.stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(BbError::NoOutput(ci_builder.to_string()));
        }
        Ok(out.stdout)
    }
}

impl BuildQuerier for BbClient {
    fn ensure_authenticated(&self) -> Result<(), BbError> {
        let failure = self.auth.get_or_init(|| {
            let status = Command::new(&self.tool)
                .arg("auth-info")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(s) if s.success() => None,
                Ok(_) => Some(format!(
                    "not logged into `{}` - run `{} auth-login`",
                    self.tool, self.tool
                )),
                Err(e) => Some(format!("could not run `{} auth-info`: {}", self.tool, e)),
            }
        });
        match failure {
            None => Ok(()),
            Some(msg) => Err(BbError::NotAuthenticated(msg.clone())),
        }
    }

    fn latest_build(&self, ci_builder: &str) -> Result<BuildRecord, BbError> {
        self.ensure_authenticated()?;
        let id = self.run_ls(ci_builder)?;
        let raw = self.run_get(ci_builder, &id)?;
        serde_json::from_slice(&raw).map_err(|e| BbError::Malformed {
            builder: ci_builder.to_string(),
            detail: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_mirrors(mirrors: &[&str]) -> BuildRecord {
        BuildRecord {
            output: BuildOutput {
                properties: BuildProperties {
                    mirrored_builders: mirrors.iter().map(|s| s.to_string()).collect(),
                },
            },
        }
    }

    #[test]
    fn test_mirror_name_strips_group_prefix() {
        let record = record_with_mirrors(&["tryserver.chromium.linux:my-try-builder"]);
        let names = mirrored_try_builders("Linux Release (NVIDIA)", &record).unwrap();
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["my-try-builder".to_string()]
        );
    }

    #[test]
    fn test_mirror_entry_without_group_is_malformed() {
        let record = record_with_mirrors(&["just-a-builder"]);
        let err = mirrored_try_builders("Linux Release (NVIDIA)", &record).unwrap_err();
        assert!(matches!(err, BbError::Malformed { .. }));
    }

    #[test]
    fn test_mirror_entry_with_extra_separator_is_malformed() {
        let record = record_with_mirrors(&["a:b:c"]);
        assert!(mirrored_try_builders("x", &record).is_err());
    }

    #[test]
    fn test_record_defaults_when_properties_absent() {
        let record: BuildRecord = serde_json::from_str(r#"{"status": "SUCCESS"}"#).unwrap();
        assert!(record.output.properties.mirrored_builders.is_empty());
        let names = mirrored_try_builders("x", &record).unwrap();
        assert!(names.is_empty());
    }

    #[test]
    fn test_record_parses_nested_mirrors() {
        let raw = r#"{
            "output": {
                "properties": {
                    "mirrored_builders": [
                        "tryserver.chromium.android:gpu-fyi-try-android-m-nexus-5x-64"
                    ]
                }
            }
        }"#;
        let record: BuildRecord = serde_json::from_str(raw).unwrap();
        let names = mirrored_try_builders("Android Release (Nexus 5X)", &record).unwrap();
        assert!(names.contains("gpu-fyi-try-android-m-nexus-5x-64"));
    }

    #[cfg(unix)]
    mod live_tool {
        use super::super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;

        /// Writes a fake `bb` shell script and returns its path.
        fn fake_bb(dir: &std::path::Path, body: &str) -> PathBuf {
            let path = dir.join("bb");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[test]
        fn test_two_step_query_pipeline() {
            let tmp = tempfile::tempdir().unwrap();
            let script = r#"
case "$1" in
  auth-info) exit 0 ;;
  ls) echo "8891234567890123456" ;;
  get)
    read -r id
    echo "{\"id\": \"$id\", \"output\": {\"properties\": {\"mirrored_builders\": [\"tryserver.chromium.linux:my-try-builder\"]}}}"
    ;;
esac"#;
            let tool = fake_bb(tmp.path(), script);
            let client = BbClient::with_tool(tool.to_string_lossy());

            let record = client.latest_build("Linux Release (NVIDIA)").unwrap();
            let names = mirrored_try_builders("Linux Release (NVIDIA)", &record).unwrap();
            assert!(names.contains("my-try-builder"));
        }

        #[test]
        fn test_empty_ls_output_is_no_output() {
            let tmp = tempfile::tempdir().unwrap();
            let tool = fake_bb(tmp.path(), "exit 0");
            let client = BbClient::with_tool(tool.to_string_lossy());

            let err = client.latest_build("Linux Release (NVIDIA)").unwrap_err();
            assert!(matches!(err, BbError::NoOutput(_)));
        }

        #[test]
        fn test_unauthenticated_tool_is_fatal() {
            let tmp = tempfile::tempdir().unwrap();
            let tool = fake_bb(
                tmp.path(),
                r#"if [ "$1" = "auth-info" ]; then exit 1; fi; echo id"#,
            );
            let client = BbClient::with_tool(tool.to_string_lossy());

            assert!(matches!(
                client.ensure_authenticated(),
                Err(BbError::NotAuthenticated(_))
            ));
            // The cached outcome keeps every later query failing too.
            assert!(matches!(
                client.latest_build("Linux Release (NVIDIA)"),
                Err(BbError::NotAuthenticated(_))
            ));
        }

        #[test]
        fn test_auth_checked_once() {
            let tmp = tempfile::tempdir().unwrap();
            let counter = tmp.path().join("auth_calls");
            let script = format!(
                r#"
case "$1" in
  auth-info) echo x >> "{0}"; exit 0 ;;
  ls) echo "1" ;;
  get) read -r id; echo "{{}}" ;;
esac"#,
                counter.display()
            );
            let tool = fake_bb(tmp.path(), &script);
            let client = BbClient::with_tool(tool.to_string_lossy());

            client.latest_build("A").unwrap();
            client.latest_build("B").unwrap();

            let calls = fs::read_to_string(&counter).unwrap();
            assert_eq!(calls.lines().count(), 1);
        }

        #[test]
        fn test_malformed_get_output() {
            let tmp = tempfile::tempdir().unwrap();
            let script = r#"
case "$1" in
  auth-info) exit 0 ;;
  ls) echo "1" ;;
  get) read -r id; echo "not json" ;;
esac"#;
            let tool = fake_bb(tmp.path(), script);
            let client = BbClient::with_tool(tool.to_string_lossy());

            let err = client.latest_build("Linux Release (NVIDIA)").unwrap_err();
            assert!(matches!(err, BbError::Malformed { .. }));
        }
    }
}
