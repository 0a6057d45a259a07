//! CI → try builder mirror resolution.
//!
//! Each CI builder passes through three lookup tiers, first match wins:
//! 1. non-Chromium exclusion set — no mirror needed, by design,
//! 2. static override table — pinned try builder,
//! 3. live Buildbucket query — mirrors extracted from the most recent
//!    ended build's output properties.
//!
//! Live queries run in a bounded parallel fan-out. Per-builder failures are
//! never raised individually: they accumulate and surface once, as a single
//! aggregate error naming every builder that needs manual table entries.

mod tables;

pub use tables::MirrorTables;

use buildbucket::{mirrored_try_builders, BbError, BuildQuerier};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Why a CI builder could not be resolved to a set of try mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// `bb` produced no output at either step of the query pipeline.
    NoOutput,
    /// The build record or one of its mirror entries had an unexpected shape.
    Malformed(String),
    /// The query tool could not be run at all.
    QueryFailed(String),
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedReason::NoOutput => write!(f, "no Buildbucket output"),
            UnresolvedReason::Malformed(detail) => write!(f, "malformed response: {detail}"),
            UnresolvedReason::QueryFailed(detail) => write!(f, "query failed: {detail}"),
        }
    }
}

/// Terminal state of one CI builder's resolution. Exactly one is reached
/// per builder, decided by the first applicable tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Non-Chromium builder: contributes nothing, counts as resolved.
    Excluded,
    /// Found in the static override table; the live tier is never reached.
    StaticMirror(String),
    /// Live query succeeded with zero or more mirrors.
    Live(BTreeSet<String>),
    /// Live query failed; the builder lands in the failure accumulator.
    Unresolved(UnresolvedReason),
}

/// Resolves a single CI builder through the three tiers.
pub fn resolve_one(
    ci_builder: &str,
    tables: &MirrorTables,
    querier: &dyn BuildQuerier,
) -> Resolution {
    if tables.is_non_chromium(ci_builder) {
        return Resolution::Excluded;
    }
    if let Some(try_builder) = tables.static_mirror(ci_builder) {
        return Resolution::StaticMirror(try_builder.to_string());
    }
    match querier.latest_build(ci_builder) {
        Ok(record) => match mirrored_try_builders(ci_builder, &record) {
            Ok(names) => Resolution::Live(names),
            Err(e) => Resolution::Unresolved(unresolved_reason(e)),
        },
        Err(e) => Resolution::Unresolved(unresolved_reason(e)),
    }
}

fn unresolved_reason(err: BbError) -> UnresolvedReason {
    match err {
        BbError::NoOutput(_) => UnresolvedReason::NoOutput,
        BbError::Malformed { detail, .. } => UnresolvedReason::Malformed(detail),
        other => UnresolvedReason::QueryFailed(other.to_string()),
    }
}

/// Merged outcome of one resolution pass. Every input CI builder either
/// contributed to `mirrors` (possibly zero names) or appears in
/// `unresolved` — never both, never neither.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MirrorSet {
    pub mirrors: BTreeSet<String>,
    pub unresolved: BTreeMap<String, UnresolvedReason>,
}

impl MirrorSet {
    pub fn record(&mut self, ci_builder: &str, resolution: Resolution) {
        match resolution {
            Resolution::Excluded => {}
            Resolution::StaticMirror(try_builder) => {
                self.mirrors.insert(try_builder);
            }
            Resolution::Live(names) => {
                self.mirrors.extend(names);
            }
            Resolution::Unresolved(reason) => {
                self.unresolved.insert(ci_builder.to_string(), reason);
            }
        }
    }

    /// Applies the failure policy: any unresolved builder turns the whole
    /// pass into a single aggregate error listing all of them.
    pub fn into_result(self) -> Result<BTreeSet<String>, ResolverError> {
        if self.unresolved.is_empty() {
            Ok(self.mirrors)
        } else {
            Err(ResolverError::Unresolved(self.unresolved))
        }
    }
}

/// Errors from a full resolution pass.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// The query tool is not authenticated; nothing was resolved.
    #[error(transparent)]
    Auth(#[from] BbError),
    /// One or more builders had no resolvable mirror.
    #[error("{}", unresolved_message(.0))]
    Unresolved(BTreeMap<String, UnresolvedReason>),
}

fn unresolved_message(unresolved: &BTreeMap<String, UnresolvedReason>) -> String {
    let mut msg = format!(
        "no try mirrors resolved for {} builder(s); add them to the static \
         override table or the non-Chromium set:",
        unresolved.len()
    );
    for (builder, reason) in unresolved {
        msg.push_str(&format!("\n  {builder}: {reason}"));
    }
    msg
}

/// Resolves every CI builder in `ci_builders`, querying Buildbucket with at
/// most `jobs` concurrent subprocesses.
///
/// Authentication is verified once, before the fan-out begins; an
/// unauthenticated tool aborts the whole pass with no partial result.
/// Individual resolutions are independent and merge by set union, so no
/// ordering is guaranteed or needed.
pub async fn resolve_try_mirrors(
    ci_builders: BTreeSet<String>,
    tables: Arc<MirrorTables>,
    querier: Arc<dyn BuildQuerier>,
    jobs: usize,
) -> Result<MirrorSet, ResolverError> {
    querier.ensure_authenticated()?;

    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
    let mut tasks = JoinSet::new();

    for builder in ci_builders {
        let tables = Arc::clone(&tables);
        let querier = Arc::clone(&querier);
        let semaphore = Arc::clone(&semaphore);
        let name = builder.clone();
        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                // The semaphore is never closed while tasks are live.
                Err(_) => {
                    return (
                        name,
                        Resolution::Unresolved(UnresolvedReason::QueryFailed(
                            "worker pool closed".to_string(),
                        )),
                    );
                }
            };
            // The subprocess calls block, so they run off the async runtime.
            let outcome = tokio::task::spawn_blocking(move || {
                resolve_one(&builder, &tables, querier.as_ref())
            })
            .await;
            match outcome {
                Ok(resolution) => (name, resolution),
                Err(e) => (
                    name,
                    Resolution::Unresolved(UnresolvedReason::QueryFailed(format!(
                        "resolution task failed: {e}"
                    ))),
                ),
            }
        });
    }

    let mut merged = MirrorSet::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((builder, resolution)) => merged.record(&builder, resolution),
            Err(e) => eprintln!("warning: resolution task lost: {e}"),
        }
    }
    Ok(merged)
}
