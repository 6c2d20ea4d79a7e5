use std::sync::Mutex;

use scraps::api::{ApiClient, ApiError};
use scraps::claim::{ClaimClient, ClaimError};
use scraps_core::claims::{ClaimProtocolError, ClaimVerdict};
use scraps_core::reference::{BranchRef, RepoRef};
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const CLAIM_PATH: &str = "/stores/acme/repos/web/branches/main/coordinate/claim";

fn branch() -> BranchRef {
    RepoRef::parse("acme/web:main")
        .unwrap()
        .require_branch()
        .unwrap()
}

fn client(server: &MockServer) -> ClaimClient {
    ClaimClient::new(ApiClient::new(server.uri(), "k").unwrap())
}

fn s(v: &[&str]) -> Vec<String> {
    v.iter().map(|p| (*p).to_owned()).collect()
}

#[tokio::test]
async fn granted_claim_posts_body_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CLAIM_PATH))
        .and(header("authorization", "Bearer k"))
        .and(body_json(json!({
            "agent_id": "w1",
            "patterns": ["*.go"],
            "claim": "refactor",
            "ttl_seconds": 300
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"expires_at": "2026-01-01T00:05:00Z"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let outcome = client(&server)
        .claim(&branch(), s(&["*.go"]), "refactor", 300, Some("w1".to_owned()))
        .await
        .unwrap();
    assert_eq!(outcome.agent_id, "w1");
    assert_eq!(
        outcome.verdict,
        ClaimVerdict::Granted {
            expires_at: "2026-01-01T00:05:00Z".to_owned()
        }
    );
}

#[tokio::test]
async fn conflict_lists_every_competitor_on_409_and_200() {
    let conflict = json!({
        "type": "claim_conflict",
        "conflicts": [
            {"agent_id": "a1", "agent_name": "alice", "patterns": ["src/**"], "claim": "auth"},
            {"agent_id": "a2", "patterns": ["src/*.ts"], "claim": ""}
        ]
    });

    for status in [409, 200] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CLAIM_PATH))
            .respond_with(ResponseTemplate::new(status).set_body_json(conflict.clone()))
            .mount(&server)
            .await;

        let outcome = client(&server)
            .claim(&branch(), s(&["src/a.ts"]), "", 300, None)
            .await
            .unwrap();
        assert!(outcome.agent_id.starts_with("cli-"));
        let ClaimVerdict::Conflict { competitors } = outcome.verdict else {
            panic!("expected conflict for status {status}");
        };
        let names: Vec<String> = competitors.iter().map(|c| c.display_name()).collect();
        assert_eq!(names, vec!["alice (a1)", "a2"]);
        assert_eq!(competitors[0].description, "auth");
    }
}

#[tokio::test]
async fn conflict_status_without_conflict_body_is_an_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CLAIM_PATH))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"error": "branch locked"})))
        .mount(&server)
        .await;

    let err = client(&server)
        .claim(&branch(), s(&["*.go"]), "", 300, None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "API error (409): branch locked");
}

#[tokio::test]
async fn unauthorized_claim_is_reported_as_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CLAIM_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "invalid api key"})))
        .mount(&server)
        .await;

    let err = client(&server)
        .claim(&branch(), s(&["*.go"]), "", 300, None)
        .await
        .unwrap_err();
    let ClaimError::Api(api) = &err else {
        panic!("expected api error, got {err:?}");
    };
    assert!(api.is_auth());
    assert_eq!(err.to_string(), "API error (401): invalid api key");
}

#[tokio::test]
async fn success_without_expiry_is_a_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CLAIM_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"type": "queued"})))
        .mount(&server)
        .await;

    let err = client(&server)
        .claim(&branch(), s(&["*.go"]), "", 300, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClaimError::Protocol(ClaimProtocolError::UnexpectedType(ref t)) if t == "queued"
    ));
}

#[tokio::test]
async fn invalid_requests_never_reach_the_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let c = client(&server);
    assert!(matches!(
        c.claim(&branch(), vec![], "", 300, None).await,
        Err(ClaimError::Request(_))
    ));
    assert!(matches!(
        c.claim(&branch(), s(&["  "]), "", 300, None).await,
        Err(ClaimError::Request(_))
    ));
    assert!(matches!(
        c.release(&branch(), s(&["*.go"]), "").await,
        Err(ClaimError::Request(_))
    ));
}

#[tokio::test]
async fn release_sends_delete_and_surfaces_server_errors_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(CLAIM_PATH))
        .and(body_json(json!({"agent_id": "w1", "patterns": ["*.go"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"released": 1})))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(CLAIM_PATH))
        .and(body_json(json!({"agent_id": "w2", "patterns": ["*.go"]})))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"message": "no claims held by w2"})),
        )
        .mount(&server)
        .await;

    let c = client(&server);
    c.release(&branch(), s(&["*.go"]), "w1").await.unwrap();

    let err = c.release(&branch(), s(&["*.go"]), "w2").await.unwrap_err();
    let ClaimError::Api(ApiError::Http { status, message }) = err else {
        panic!("expected http error");
    };
    assert_eq!(status, 404);
    assert_eq!(message, "no claims held by w2");
}

#[tokio::test]
async fn release_noop_reply_is_returned_as_sent() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(CLAIM_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"released": 0, "message": "no matching claims for w2"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let outcome = client(&server)
        .release(&branch(), s(&["*.go"]), "w2")
        .await
        .unwrap();
    assert_eq!(outcome.agent_id, "w2");
    assert_eq!(outcome.released(), Some(0));
    assert_eq!(outcome.message(), Some("no matching claims for w2"));
    assert_eq!(
        outcome.body,
        json!({"released": 0, "message": "no matching claims for w2"})
    );
}

/// A claim board that conflicts whenever one glob matches the other side's pattern.
#[derive(Default)]
struct ClaimBoard {
    held: Mutex<Vec<(String, Vec<String>)>>,
}

fn overlaps(a: &str, b: &str) -> bool {
    let hit = |pat: &str, text: &str| glob::Pattern::new(pat).map(|p| p.matches(text)).unwrap_or(false);
    a == b || hit(a, b) || hit(b, a)
}

impl Respond for ClaimBoard {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        let agent = body["agent_id"].as_str().unwrap().to_owned();
        let patterns: Vec<String> = serde_json::from_value(body["patterns"].clone()).unwrap();
        let mut held = self.held.lock().unwrap();

        if req.method.as_str() == "DELETE" {
            let before = held.len();
            held.retain(|(a, p)| !(a == &agent && p == &patterns));
            if held.len() == before {
                return ResponseTemplate::new(404)
                    .set_body_json(json!({"message": format!("no claims held by {agent}")}));
            }
            return ResponseTemplate::new(200).set_body_json(json!({"released": 1}));
        }

        let conflicts: Vec<Value> = held
            .iter()
            .filter(|(a, p)| {
                a != &agent && p.iter().any(|x| patterns.iter().any(|y| overlaps(x, y)))
            })
            .map(|(a, p)| json!({"agent_id": a, "patterns": p, "claim": "work"}))
            .collect();
        if !conflicts.is_empty() {
            return ResponseTemplate::new(409)
                .set_body_json(json!({"type": "claim_conflict", "conflicts": conflicts}));
        }
        held.push((agent, patterns));
        ResponseTemplate::new(200).set_body_json(json!({"expires_at": "2026-01-01T00:05:00Z"}))
    }
}

#[tokio::test]
async fn overlapping_claims_conflict_until_the_holder_releases() {
    let server = MockServer::start().await;
    Mock::given(path(CLAIM_PATH))
        .respond_with(ClaimBoard::default())
        .mount(&server)
        .await;
    let c = client(&server);
    let b = branch();

    let first = c
        .claim(&b, s(&["src/**"]), "auth", 300, Some("w1".to_owned()))
        .await
        .unwrap();
    assert!(first.verdict.is_granted());

    let second = c
        .claim(&b, s(&["src/a.ts"]), "fix", 300, Some("w2".to_owned()))
        .await
        .unwrap();
    let ClaimVerdict::Conflict { competitors } = second.verdict else {
        panic!("expected conflict");
    };
    assert_eq!(competitors.len(), 1);
    assert_eq!(competitors[0].agent_id, "w1");
    assert_eq!(competitors[0].patterns, s(&["src/**"]));

    // Only the holder can release.
    let err = c.release(&b, s(&["src/**"]), "w2").await.unwrap_err();
    assert_eq!(err.to_string(), "API error (404): no claims held by w2");

    c.release(&b, s(&["src/**"]), "w1").await.unwrap();
    let retry = c
        .claim(&b, s(&["src/a.ts"]), "fix", 300, Some("w2".to_owned()))
        .await
        .unwrap();
    assert!(retry.verdict.is_granted());

    let disjoint = c
        .claim(&b, s(&["docs/*.md"]), "docs", 300, Some("w3".to_owned()))
        .await
        .unwrap();
    assert!(disjoint.verdict.is_granted());
}
