// =============================================================================
// Matrixon Matrix NextServer - Testkit Sync Convergence
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Long-poll /sync stepping and the convergence loop used by integration
//   tests to wait for federated state to become visible. A test expresses
//   the state it expects as a set of independent checks; the loop keeps
//   syncing, advancing the continuation token every step, until every check
//   has passed once or the wall-clock budget is spent.
//
// =============================================================================

use std::time::{Duration, Instant};

use reqwest::Method;
use ruma::{presence::PresenceState, UserId};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::http::RequestOptions;
use crate::json;

/// Configuration for one `/sync` request. The empty value
/// (`SyncRequest::default()`) is valid and performs a full sync due to the
/// lack of a since token.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    /// A point in time to continue a sync from. This should be the
    /// `next_batch` token returned by an earlier call to this endpoint.
    pub since: Option<String>,
    /// The ID of a filter created using the filter API, or a filter JSON
    /// object encoded as a string. The server detects which by whether the
    /// first character is a `{` open brace.
    pub filter: Option<String>,
    /// Whether to include the full state for all rooms the user is a member
    /// of. When set, the server ignores the poll timeout and answers
    /// immediately, possibly with an empty timeline.
    pub full_state: bool,
    /// Presence to advertise while polling. Omitted means the server marks
    /// the client online by default.
    pub set_presence: Option<PresenceState>,
    /// Maximum time the server may hold the request open before answering
    /// with empty fields. Defaults to 1000ms, short enough for tests to
    /// observe quiet responses.
    pub timeout: Option<Duration>,
}

/// One independent convergence condition.
///
/// Called with the syncing user and the latest envelope; returns `Ok(())`
/// once the expected state is visible, or a human-readable reason it is not
/// yet. Checks must be pure functions of their arguments so the loop can
/// invoke them against every response without ordering concerns.
pub type SyncCheck = Box<dyn Fn(&UserId, &Value) -> std::result::Result<(), String> + Send + Sync>;

fn build_query(request: &SyncRequest) -> Vec<(String, String)> {
    let timeout = request
        .timeout
        .map_or_else(|| "1000".to_owned(), |t| t.as_millis().to_string());
    let mut query = vec![("timeout".to_owned(), timeout)];
    if let Some(since) = &request.since {
        query.push(("since".to_owned(), since.clone()));
    }
    if let Some(filter) = &request.filter {
        query.push(("filter".to_owned(), filter.clone()));
    }
    if request.full_state {
        query.push(("full_state".to_owned(), "true".to_owned()));
    }
    if let Some(presence) = &request.set_presence {
        query.push(("set_presence".to_owned(), presence.as_str().to_owned()));
    }
    query
}

struct Checker {
    check: SyncCheck,
    failures: Vec<String>,
}

impl Client {
    /// # `GET /_matrix/client/r0/sync`
    ///
    /// Performs exactly one sync step and returns the envelope together with
    /// its `next_batch` continuation token. A missing or malformed
    /// `next_batch` is an error: without it the caller cannot advance, and
    /// silently resyncing from the same point would hide server bugs.
    ///
    /// Never retries. A transport failure or non-2xx status aborts the step.
    #[instrument(level = "debug", skip(self, request), fields(user_id = %self.user_id))]
    pub async fn sync_once(&self, request: &SyncRequest) -> Result<(Value, String)> {
        let mut options = RequestOptions::new();
        for (key, value) in build_query(request) {
            options = options.query(key, value);
        }
        let response = self
            .must_do(Method::GET, &["_matrix", "client", "r0", "sync"], options)
            .await?;
        let body = response.json()?;
        let next_batch = json::field_str(&body, "next_batch")?;
        Ok((body, next_batch))
    }

    /// Blocks and continually calls `/sync` (advancing the since token)
    /// until every check in `checks` has passed. Returns the final since
    /// token, suitable for continuing incrementally.
    ///
    /// Initial sync: pass `SyncRequest::default()` and the loop starts from
    /// scratch. Incremental sync: seed `since` with a token from an earlier
    /// call so only new activity is inspected. An empty check set still
    /// performs one step, which is the idiomatic way to obtain a fresh
    /// token.
    ///
    /// Each check is retired permanently the first time it passes and is
    /// never invoked again, so checks need not be resilient to observing
    /// their condition twice. The pending set is rebuilt every response;
    /// checks run independently and may retire in any order. Every rejection
    /// is recorded, and on timeout the error carries the complete rejection
    /// history of every check still pending.
    ///
    /// The token advances unconditionally with every response, whether or
    /// not any check passed, so a slow condition cannot cause the same
    /// window to be scanned twice. The wall-clock budget
    /// (`sync_until_timeout`) is checked at loop-iteration boundaries only;
    /// a response in flight when the budget expires is still evaluated.
    #[instrument(level = "debug", skip(self, request, checks), fields(user_id = %self.user_id, checks = checks.len()))]
    pub async fn sync_until(&self, mut request: SyncRequest, checks: Vec<SyncCheck>) -> Result<String> {
        let start = Instant::now();
        let mut responses = 0usize;
        let mut pending: Vec<Checker> = checks
            .into_iter()
            .map(|check| Checker {
                check,
                failures: Vec::new(),
            })
            .collect();

        loop {
            if start.elapsed() > self.sync_until_timeout {
                let failures = pending
                    .iter()
                    .map(|c| c.failures.join("\n"))
                    .collect::<Vec<_>>()
                    .join("\n");
                return Err(Error::SyncTimeout {
                    user_id: self.user_id.clone(),
                    elapsed: start.elapsed(),
                    responses,
                    failures,
                });
            }

            let (response, next_batch) = self.sync_once(&request).await?;
            responses += 1;
            request.since = Some(next_batch.clone());

            // Rebuild the pending set rather than removing in place: a pass
            // retires the check, a failure appends to its log and keeps it.
            pending = pending
                .into_iter()
                .filter_map(|mut checker| match (checker.check)(&self.user_id, &response) {
                    Ok(()) => None,
                    Err(why) => {
                        checker.failures.push(format!(
                            "[t={:?}] response #{}: {}",
                            start.elapsed(),
                            responses,
                            why
                        ));
                        Some(checker)
                    }
                })
                .collect();

            if pending.is_empty() {
                debug!(responses, "all sync checks passed");
                return Ok(next_batch);
            }
        }
    }

    /// Older, element-level form of the convergence wait: scans the array
    /// under the lookup path `key` in each response and returns as soon as
    /// `check` accepts a single element, even part-way through a response.
    /// Missing or non-array keys are skipped silently, not treated as
    /// failures.
    ///
    /// [`Client::sync_until`] supersedes this for new tests, but the
    /// element-at-a-time short-circuit is observable behavior some callers
    /// depend on, so both forms are kept.
    ///
    /// Returns the since token of the response containing the accepted
    /// element. On timeout the error reports how many elements were checked
    /// and the last element inspected.
    #[instrument(level = "debug", skip(self, check), fields(user_id = %self.user_id))]
    pub async fn sync_until_array(
        &self,
        since: Option<String>,
        filter: Option<String>,
        key: &str,
        check: impl Fn(&Value) -> bool,
    ) -> Result<String> {
        let start = Instant::now();
        let mut responses = 0usize;
        let mut checked = 0usize;
        let mut last_element: Option<String> = None;
        let mut request = SyncRequest {
            since,
            filter,
            ..Default::default()
        };

        loop {
            if start.elapsed() > self.sync_until_timeout {
                let failures = format!(
                    "called the check function {} times. Last element: {}",
                    checked,
                    last_element.as_deref().unwrap_or("<none>")
                );
                return Err(Error::SyncTimeout {
                    user_id: self.user_id.clone(),
                    elapsed: start.elapsed(),
                    responses,
                    failures,
                });
            }

            let (response, next_batch) = self.sync_once(&request).await?;
            responses += 1;
            request.since = Some(next_batch.clone());

            if let Some(elements) = json::lookup(&response, key).and_then(Value::as_array) {
                for element in elements {
                    last_element = Some(json::snippet(&element.to_string()));
                    if check(element) {
                        return Ok(next_batch);
                    }
                    checked += 1;
                }
            }
        }
    }
}
