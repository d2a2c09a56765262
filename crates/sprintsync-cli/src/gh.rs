//! [`TrackerClient`] backed by the `gh` command line tool.
//!
//! Every call shells out to `gh` with the user's existing authentication.
//! Failed invocations are classified from stderr into the tracker error
//! taxonomy so the engine can retry, abort, or treat them as duplicates.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use sprintsync_core::tracker::{
    BoardStatus, IssuePayload, LabelPayload, MilestonePayload, RemoteId, RemoteRef, ResourceKey,
    ResourceKind, ResourcePayload, TrackerClient, TrackerError,
};

use crate::config::BoardSection;

pub struct GhTracker {
    program: String,
    owner: String,
    repo: String,
    board: Option<BoardSection>,
}

impl GhTracker {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        board: Option<BoardSection>,
    ) -> Self {
        Self {
            program: "gh".to_string(),
            owner: owner.into(),
            repo: repo.into(),
            board,
        }
    }

    fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    async fn run(&self, args: Vec<String>) -> Result<String, TrackerError> {
        tracing::trace!(program = %self.program, ?args, "invoking gh");
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| TrackerError::Unknown(format!("failed to run {}: {e}", self.program)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let error = classify(&stderr);
            tracing::debug!(status = ?output.status.code(), error = %error, "gh call failed");
            Err(error)
        }
    }

    // -- argument builders --------------------------------------------------

    fn lookup_args(&self, key: &ResourceKey) -> Vec<String> {
        let slug = self.slug();
        let slug = slug.as_str();
        match key.kind {
            ResourceKind::Label => args([
                "label", "list", "--repo", slug, "--search", key.name.as_str(), "--json", "name",
                "--limit", "1000",
            ]),
            ResourceKind::Milestone => args([
                "api",
                format!("repos/{slug}/milestones?state=all&per_page=100").as_str(),
                "--paginate",
                "--jq",
                ".[] | {number, title}",
            ]),
            ResourceKind::Issue => args([
                "issue",
                "list",
                "--repo",
                slug,
                "--state",
                "all",
                "--search",
                format!("\"{}\" in:title", key.name.replace('"', "")).as_str(),
                "--json",
                "number,title",
                "--limit",
                "100",
            ]),
        }
    }

    fn create_args(&self, payload: &ResourcePayload) -> Vec<String> {
        let slug = self.slug();
        let slug = slug.as_str();
        match payload {
            ResourcePayload::Label(label) => {
                let mut out = args(["label", "create", label.name.as_str(), "--repo", slug]);
                push_label_fields(&mut out, label);
                out
            }
            ResourcePayload::Milestone(milestone) => {
                let mut out = args([
                    "api",
                    format!("repos/{slug}/milestones").as_str(),
                    "--method",
                    "POST",
                ]);
                push_milestone_fields(&mut out, milestone);
                out.extend(args(["--jq", ".number"]));
                out
            }
            ResourcePayload::Issue(issue) => {
                let mut out = args([
                    "api",
                    format!("repos/{slug}/issues").as_str(),
                    "--method",
                    "POST",
                ]);
                push_issue_fields(&mut out, issue);
                out.extend(args(["--jq", ".number"]));
                out
            }
        }
    }

    fn update_args(&self, remote: &RemoteRef, payload: &ResourcePayload) -> Vec<String> {
        let slug = self.slug();
        let slug = slug.as_str();
        match payload {
            ResourcePayload::Label(label) => {
                let mut out = args(["label", "edit", remote.id.as_str(), "--repo", slug]);
                push_label_fields(&mut out, label);
                out
            }
            ResourcePayload::Milestone(milestone) => {
                let mut out = args([
                    "api",
                    format!("repos/{slug}/milestones/{}", remote.id).as_str(),
                    "--method",
                    "PATCH",
                ]);
                push_milestone_fields(&mut out, milestone);
                out
            }
            ResourcePayload::Issue(issue) => {
                let mut out = args([
                    "api",
                    format!("repos/{slug}/issues/{}", remote.id).as_str(),
                    "--method",
                    "PATCH",
                ]);
                push_issue_fields(&mut out, issue);
                out
            }
        }
    }

    fn board(&self) -> Result<&BoardSection, TrackerError> {
        self.board
            .as_ref()
            .ok_or_else(|| TrackerError::Unknown("no project board configured".to_string()))
    }
}

fn args<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    items.into_iter().map(str::to_string).collect()
}

fn field(out: &mut Vec<String>, flag: &str, name: &str, value: &str) {
    out.push(flag.to_string());
    out.push(format!("{name}={value}"));
}

fn push_label_fields(out: &mut Vec<String>, label: &LabelPayload) {
    if let Some(color) = &label.color {
        out.extend(args(["--color", color.as_str()]));
    }
    if let Some(description) = &label.description {
        out.extend(args(["--description", description.as_str()]));
    }
}

fn push_milestone_fields(out: &mut Vec<String>, milestone: &MilestonePayload) {
    field(out, "-f", "title", &milestone.title);
    field(out, "-f", "description", &milestone.description);
    if let Some(due_on) = &milestone.due_on {
        field(out, "-f", "due_on", due_on);
    }
}

fn push_issue_fields(out: &mut Vec<String>, issue: &IssuePayload) {
    field(out, "-f", "title", &issue.title);
    field(out, "-f", "body", &issue.body);
    for label in &issue.labels {
        field(out, "-f", "labels[]", label);
    }
    if let Some(milestone) = &issue.milestone {
        // -F sends the milestone as a number.
        field(out, "-F", "milestone", milestone.as_str());
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Numbered {
    number: u64,
    title: String,
}

fn unexpected(output: &str, error: impl std::fmt::Display) -> TrackerError {
    TrackerError::Unknown(format!("unexpected gh output ({error}): {}", output.trim()))
}

/// Find `key` in the output of the lookup command built for it.
fn parse_lookup(key: &ResourceKey, stdout: &str) -> Result<Option<RemoteRef>, TrackerError> {
    let found = match key.kind {
        ResourceKind::Label => {
            let labels: Vec<Named> =
                serde_json::from_str(stdout).map_err(|e| unexpected(stdout, e))?;
            labels
                .into_iter()
                .find(|l| l.name == key.name)
                .map(|l| RemoteId(l.name))
        }
        ResourceKind::Milestone => {
            // One JSON object per line from `--jq`.
            let mut found = None;
            for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
                let milestone: Numbered =
                    serde_json::from_str(line).map_err(|e| unexpected(line, e))?;
                if milestone.title == key.name {
                    found = Some(RemoteId(milestone.number.to_string()));
                    break;
                }
            }
            found
        }
        ResourceKind::Issue => {
            let issues: Vec<Numbered> =
                serde_json::from_str(stdout).map_err(|e| unexpected(stdout, e))?;
            issues
                .into_iter()
                .filter(|i| i.title == key.name)
                .map(|i| i.number)
                .min()
                .map(|n| RemoteId(n.to_string()))
        }
    };
    Ok(found.map(|id| RemoteRef {
        key: key.clone(),
        id,
    }))
}

fn parse_number(stdout: &str) -> Result<RemoteId, TrackerError> {
    let text = stdout.trim();
    text.parse::<u64>()
        .map(|n| RemoteId(n.to_string()))
        .map_err(|e| unexpected(text, e))
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "http 429",
    "abuse detection",
    "too many requests",
];

const AUTH_MARKERS: &[&str] = &[
    "http 401",
    "bad credentials",
    "gh auth login",
    "authentication required",
    "requires authentication",
    "not logged into",
];

const DUPLICATE_MARKERS: &[&str] = &["already exists", "already_exists"];

/// Map `gh` stderr onto a [`TrackerError`].
pub fn classify(stderr: &str) -> TrackerError {
    let lower = stderr.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if has(RATE_LIMIT_MARKERS) {
        TrackerError::RateLimited {
            retry_after: retry_after_hint(&lower),
        }
    } else if has(AUTH_MARKERS) {
        TrackerError::AuthFailed(first_line(stderr))
    } else if has(DUPLICATE_MARKERS) {
        TrackerError::Duplicate
    } else {
        TrackerError::Unknown(first_line(stderr))
    }
}

fn first_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("gh exited with an error")
        .to_string()
}

/// Seconds from a "retry after N" or "retry-after: N" hint.
fn retry_after_hint(lower: &str) -> Option<Duration> {
    ["retry after ", "retry-after: ", "retry-after "]
        .iter()
        .find_map(|marker| {
            let rest = &lower[lower.find(marker)? + marker.len()..];
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u64>().ok()
        })
        .map(Duration::from_secs)
}

// ---------------------------------------------------------------------------
// TrackerClient
// ---------------------------------------------------------------------------

#[async_trait]
impl TrackerClient for GhTracker {
    async fn exists(&self, key: &ResourceKey) -> Result<Option<RemoteRef>, TrackerError> {
        let stdout = self.run(self.lookup_args(key)).await?;
        parse_lookup(key, &stdout)
    }

    async fn create(&self, payload: &ResourcePayload) -> Result<RemoteRef, TrackerError> {
        let key = payload.key();
        let stdout = self.run(self.create_args(payload)).await?;
        let id = match payload {
            ResourcePayload::Label(label) => RemoteId(label.name.clone()),
            _ => parse_number(&stdout)?,
        };
        tracing::debug!(key = %key, id = %id, "created via gh");
        Ok(RemoteRef { key, id })
    }

    async fn update(
        &self,
        remote: &RemoteRef,
        payload: &ResourcePayload,
    ) -> Result<(), TrackerError> {
        self.run(self.update_args(remote, payload)).await.map(|_| ())
    }

    async fn set_board_status(
        &self,
        remote: &RemoteRef,
        status: BoardStatus,
    ) -> Result<(), TrackerError> {
        let board = self.board()?;
        if status != BoardStatus::Todo {
            return Err(TrackerError::Unknown(format!(
                "no board option configured for status {status}"
            )));
        }

        let url = format!("https://github.com/{}/issues/{}", self.slug(), remote.id);
        let item = self
            .run(args([
                "project",
                "item-add",
                board.project_number.to_string().as_str(),
                "--owner",
                self.owner.as_str(),
                "--url",
                url.as_str(),
                "--format",
                "json",
                "--jq",
                ".id",
            ]))
            .await?;
        let item = item.trim();
        if item.is_empty() {
            return Err(unexpected(item, "missing project item id"));
        }

        self.run(args([
            "project",
            "item-edit",
            "--id",
            item,
            "--project-id",
            board.project_id.as_str(),
            "--field-id",
            board.status_field_id.as_str(),
            "--single-select-option-id",
            board.todo_option_id.as_str(),
        ]))
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> GhTracker {
        GhTracker::new("acme", "roadmap", None)
    }

    #[test]
    fn classifies_auth_failures() {
        let err = classify("HTTP 401: Bad credentials (https://api.github.com/graphql)\n");
        assert!(matches!(err, TrackerError::AuthFailed(ref m) if m.starts_with("HTTP 401")));
        assert!(matches!(
            classify("To get started with GitHub CLI, please run:  gh auth login"),
            TrackerError::AuthFailed(_)
        ));
    }

    #[test]
    fn classifies_rate_limits_with_hint() {
        assert_eq!(
            classify("HTTP 403: API rate limit exceeded for user ID 1."),
            TrackerError::RateLimited { retry_after: None }
        );
        assert_eq!(
            classify("HTTP 429: Too Many Requests\nRetry-After: 30"),
            TrackerError::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            }
        );
    }

    #[test]
    fn classifies_duplicates() {
        assert_eq!(
            classify("label with name \"sprint-0\" already exists; use `--force` to update"),
            TrackerError::Duplicate
        );
        assert_eq!(
            classify(r#"HTTP 422: Validation Failed ({"resource":"Milestone","code":"already_exists","field":"title"})"#),
            TrackerError::Duplicate
        );
    }

    #[test]
    fn unknown_errors_keep_first_line() {
        assert_eq!(
            classify("\n  could not resolve to a Repository\nmore detail"),
            TrackerError::Unknown("could not resolve to a Repository".into())
        );
        assert_eq!(
            classify(""),
            TrackerError::Unknown("gh exited with an error".into())
        );
    }

    #[test]
    fn parses_label_lookup_exactly() {
        let key = ResourceKey::label("sprint-1");
        let out = r#"[{"name":"sprint-10"},{"name":"sprint-1"}]"#;
        let found = parse_lookup(&key, out).unwrap().unwrap();
        assert_eq!(found.id.as_str(), "sprint-1");
        assert!(parse_lookup(&ResourceKey::label("sprint-2"), out).unwrap().is_none());
    }

    #[test]
    fn parses_milestone_json_lines() {
        let key = ResourceKey::milestone("Sprint 1: Core");
        let out = "{\"number\":3,\"title\":\"Sprint 0: Foundation\"}\n{\"number\":4,\"title\":\"Sprint 1: Core\"}\n";
        assert_eq!(parse_lookup(&key, out).unwrap().unwrap().id.as_str(), "4");
    }

    #[test]
    fn issue_lookup_picks_lowest_exact_match() {
        let key = ResourceKey::issue("[0.1] Setup");
        let out = r#"[{"number":9,"title":"[0.1] Setup"},{"number":5,"title":"[0.1] Setup"},{"number":2,"title":"[0.1] Setup repo"}]"#;
        assert_eq!(parse_lookup(&key, out).unwrap().unwrap().id.as_str(), "5");
    }

    #[test]
    fn malformed_output_is_unknown_error() {
        let err = parse_lookup(&ResourceKey::label("x"), "not json").unwrap_err();
        assert!(matches!(err, TrackerError::Unknown(ref m) if m.contains("unexpected gh output")));
        assert!(parse_number("12\n").is_ok());
        assert!(parse_number("").is_err());
    }

    #[test]
    fn issue_create_args_carry_labels_and_milestone() {
        let payload = ResourcePayload::Issue(IssuePayload {
            title: "[0.1] Setup".into(),
            body: "body".into(),
            labels: vec!["sprint-0".into(), "task".into()],
            milestone: Some(RemoteId("3".into())),
        });
        let args = tracker().create_args(&payload);
        assert_eq!(args[..4], ["api", "repos/acme/roadmap/issues", "--method", "POST"]);
        assert!(args.windows(2).any(|w| w == ["-f", "labels[]=task"]));
        assert!(args.windows(2).any(|w| w == ["-F", "milestone=3"]));
        assert_eq!(args[args.len() - 2..], ["--jq", ".number"]);
    }

    #[test]
    fn milestone_create_args_carry_description_and_due_date() {
        let payload = ResourcePayload::Milestone(MilestonePayload {
            title: "Sprint 0: Foundation".into(),
            description: "First week".into(),
            due_on: Some("2026-11-01T00:00:00Z".into()),
        });
        let args = tracker().create_args(&payload);
        assert_eq!(args[..4], ["api", "repos/acme/roadmap/milestones", "--method", "POST"]);
        assert!(args.windows(2).any(|w| w == ["-f", "title=Sprint 0: Foundation"]));
        assert!(args.windows(2).any(|w| w == ["-f", "description=First week"]));
        assert!(args.windows(2).any(|w| w == ["-f", "due_on=2026-11-01T00:00:00Z"]));
        assert_eq!(args[args.len() - 2..], ["--jq", ".number"]);
    }

    #[test]
    fn issue_update_targets_issue_number() {
        let remote = RemoteRef {
            key: ResourceKey::issue("[0.1] Setup"),
            id: RemoteId("12".into()),
        };
        let payload = ResourcePayload::Issue(IssuePayload {
            title: "[0.1] Setup".into(),
            body: "new".into(),
            labels: vec![],
            milestone: None,
        });
        let args = tracker().update_args(&remote, &payload);
        assert_eq!(args[1], "repos/acme/roadmap/issues/12");
        assert!(args.windows(2).any(|w| w == ["-f", "body=new"]));
    }

    #[test]
    fn label_lookup_searches_by_name() {
        let args = tracker().lookup_args(&ResourceKey::label("sprint-0"));
        assert_eq!(args[..4], ["label", "list", "--repo", "acme/roadmap"]);
        assert!(args.contains(&"sprint-0".to_string()));
    }

    #[tokio::test]
    async fn board_status_requires_board_config() {
        let remote = RemoteRef {
            key: ResourceKey::issue("x"),
            id: RemoteId("1".into()),
        };
        let err = tracker()
            .set_board_status(&remote, BoardStatus::Todo)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Unknown(ref m) if m.contains("no project board")));
    }
}
