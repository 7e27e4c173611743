// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Jonathan D.A. Jewell
//! Integration tests for the GitHub client against a mock server
//!
//! The client is blocking, so mocks are mounted inside the runtime and the
//! client is called outside of it.

use feedstock_tick::error::HostError;
use feedstock_tick::fetcher::{FileFetch, RawFileSource};
use feedstock_tick::github::GitHubClient;
use feedstock_tick::host::{HostingService, PullRequestSpec};
use feedstock_tick::types::PrState;
use serde_json::json;
use tokio::runtime::Runtime;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn setup() -> (Runtime, MockServer) {
    let rt = Runtime::new().unwrap();
    let server = rt.block_on(MockServer::start());
    (rt, server)
}

fn client(server: &MockServer) -> GitHubClient {
    GitHubClient::new(&server.uri(), &server.uri(), "master", Some("bot".into()), Some("s3cret".into())).unwrap()
}

fn repos(range: std::ops::Range<usize>) -> serde_json::Value {
    range
        .map(|i| json!({"name": format!("pkg{i}-feedstock"), "archived": i % 10 == 0}))
        .collect()
}

#[test]
fn test_list_repositories_follows_pages() {
    let (rt, server) = setup();
    rt.block_on(async {
        Mock::given(method("GET"))
            .and(path("/orgs/org/repos"))
            .and(query_param("page", "1"))
            .and(header("Authorization", "token s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(repos(0..100)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orgs/org/repos"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(repos(100..130)))
            .mount(&server)
            .await;
    });

    let listed = client(&server).list_repositories("org").unwrap();
    assert_eq!(listed.len(), 130);
    assert_eq!(listed.iter().filter(|r| r.archived).count(), 13);
    assert_eq!(listed[129].name, "pkg129-feedstock");
}

#[test]
fn test_error_statuses_are_classified() {
    let (rt, server) = setup();
    rt.block_on(async {
        Mock::given(path("/repos/org/missing-feedstock/pulls/1"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
            .mount(&server)
            .await;
        Mock::given(path("/repos/org/busy-feedstock/pulls/1"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("x-ratelimit-reset", "1700000000")
                    .set_body_json(json!({"message": "API rate limit exceeded"})),
            )
            .mount(&server)
            .await;
        Mock::given(path("/repos/org/old-feedstock/pulls/1"))
            .respond_with(
                ResponseTemplate::new(403).set_body_json(json!({"message": "Repository was archived so is read-only."})),
            )
            .mount(&server)
            .await;
        Mock::given(path("/repos/org/flaky-feedstock/pulls/1"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;
    });
    let client = client(&server);

    let err = client.pull_request("org", "missing-feedstock", 1).unwrap_err();
    assert!(matches!(err, HostError::NotFound(url) if url.ends_with("/repos/org/missing-feedstock/pulls/1")));

    let err = client.pull_request("org", "busy-feedstock", 1).unwrap_err();
    match err {
        HostError::RateLimited { reset } => assert_eq!(reset.map(|r| r.timestamp()), Some(1_700_000_000)),
        other => panic!("unexpected error: {other:?}"),
    }

    let err = client.pull_request("org", "old-feedstock", 1).unwrap_err();
    assert!(matches!(err, HostError::Archived(_)));

    let err = client.pull_request("org", "flaky-feedstock", 1).unwrap_err();
    assert!(matches!(err, HostError::Status { code: 502, ref message } if message == "bad gateway"));
}

#[test]
fn test_duplicate_pull_request_is_validation_conflict() {
    let (rt, server) = setup();
    rt.block_on(async {
        Mock::given(method("POST"))
            .and(path("/repos/org/numpy-feedstock/pulls"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({"message": "A pull request already exists for bot:1.1_habc123."})),
            )
            .mount(&server)
            .await;
    });

    let spec = PullRequestSpec {
        organization: "org".into(),
        repo: "numpy-feedstock".into(),
        head: "bot:1.1_habc123".into(),
        base: "master".into(),
        title: "numpy v1.1".into(),
        body: String::new(),
    };
    let err = client(&server).create_pull_request(&spec).unwrap_err();
    assert!(matches!(err, HostError::ValidationConflict(m) if m.contains("already exists")));
}

#[test]
fn test_create_pull_request_and_fork() {
    let (rt, server) = setup();
    rt.block_on(async {
        Mock::given(method("POST"))
            .and(path("/repos/org/numpy-feedstock/forks"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"owner": {"login": "bot"}})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/org/numpy-feedstock/pulls"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": 99, "number": 12, "html_url": "https://example.org/pull/12",
                "state": "open", "head": {"ref": "1.1_habc123"}, "labels": []
            })))
            .mount(&server)
            .await;
    });
    let client = client(&server);

    assert_eq!(client.ensure_fork("org", "numpy-feedstock").unwrap(), "bot");
    let spec = PullRequestSpec {
        organization: "org".into(),
        repo: "numpy-feedstock".into(),
        head: "bot:1.1_habc123".into(),
        base: "master".into(),
        title: "numpy v1.1".into(),
        body: "body".into(),
    };
    let pr = client.create_pull_request(&spec).unwrap();
    assert_eq!(pr.number, Some(12));
    assert_eq!(pr.state, PrState::Open);
    assert_eq!(pr.head_ref, "1.1_habc123");
}

#[test]
fn test_raw_fetch_reports_status() {
    let (rt, server) = setup();
    rt.block_on(async {
        Mock::given(path("/org/numpy-feedstock/master/recipe/meta.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("package:\n  name: numpy\n"))
            .mount(&server)
            .await;
    });
    let client = client(&server);

    assert_eq!(
        client.fetch_raw("org", "numpy", "recipe/meta.yaml").unwrap(),
        FileFetch::Found("package:\n  name: numpy\n".into())
    );
    assert_eq!(
        client.fetch_raw("org", "scipy", "recipe/meta.yaml").unwrap(),
        FileFetch::Status(404)
    );
}

#[test]
fn test_rate_limit_parsing() {
    let (rt, server) = setup();
    rt.block_on(async {
        Mock::given(path("/rate_limit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resources": {"core": {"limit": 5000, "remaining": 4321, "reset": 1700000000}}
            })))
            .mount(&server)
            .await;
    });

    let limit = client(&server).rate_limit().unwrap();
    assert_eq!(limit.remaining, 4321);
    assert_eq!(limit.reset.map(|r| r.timestamp()), Some(1_700_000_000));
}

#[test]
fn test_push_branch_uses_plain_remote() {
    if !feedstock_tick::git::git_available() {
        return;
    }
    let remotes = tempfile::TempDir::new().unwrap();
    let work = tempfile::TempDir::new().unwrap();
    let bare = remotes.path().join("org/numpy-feedstock.git");
    std::fs::create_dir_all(&bare).unwrap();
    feedstock_tick::git::run_git_checked(&["init", "--quiet", "--bare"], &bare).unwrap();
    feedstock_tick::git::run_git_checked(&["init", "--quiet", "-b", "master"], work.path()).unwrap();
    std::fs::write(work.path().join("README.md"), "numpy\n").unwrap();
    feedstock_tick::git::commit_all(work.path(), "initial", "test", "test@example.org").unwrap();

    let client = GitHubClient::new("http://127.0.0.1:9", "http://127.0.0.1:9", "master", Some("bot".into()), Some("s3cret".into()))
        .unwrap()
        .with_git_url(&format!("file://{}", remotes.path().display()));
    client.push_branch(work.path(), "org", "numpy-feedstock", "1.1_habc123").unwrap();

    let branches = feedstock_tick::git::run_git_checked(&["branch", "--list"], &bare).unwrap();
    assert!(branches.contains("1.1_habc123"));
}
