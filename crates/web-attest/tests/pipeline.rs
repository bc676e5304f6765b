//! End-to-end pipeline tests: wiremock serves manifests and companion
//! scripts, a scripted host stands in for the user's browser.

use assert_json_diff::assert_json_eq;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_test::assert_pending;
use web_attest::capture::CapturedArtifacts;
use web_attest::extract;
use web_attest::host::scripted::{ScriptReply, ScriptedHost, ScriptedStep};
use web_attest::{
    AttestError, CookieRecord, EventBus, EventEnvelope, Manifest, PipelineConfig, PipelineEvent,
    ProofOrchestrator, ProofStatus, Prover, ProverError, RawCapture, RequestBuilder,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn account_manifest(prepare: bool) -> serde_json::Value {
    let mut m = json!({
        "manifestVersion": "1",
        "id": "bank-balance",
        "title": "Account balance",
        "description": "Prove the current balance",
        "mode": "TLSN",
        "request": {
            "method": "GET",
            "url": "https://bank.example/api/balance?token={{token}}",
            "headers": { "Cookie": "session={{session}}" },
            "body": null,
            "vars": {
                "token": { "regex": "token=(\\w+)", "length": 32 },
                "session": { "type": "cookie", "regex": "(.+)" }
            }
        },
        "response": {
            "status": "200",
            "headers": { "Content-Type": "application/json" },
            "body": { "json": ["balance"] }
        }
    });
    if prepare {
        m["prepareUrl"] = json!("https://bank.example/login");
    }
    m
}

fn logged_in() -> RawCapture {
    RawCapture {
        cookies: vec![CookieRecord::new("session", "s-42")],
        dom: "<script>window.cfg = 'token=abc123';</script>".into(),
    }
}

fn drain(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.event);
    }
    events
}

async fn serve_manifest(server: &MockServer, manifest: &serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/manifests/bank/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(manifest))
        .mount(server)
        .await;
}

#[tokio::test]
async fn direct_manifest_from_url_needs_no_capture() {
    let server = MockServer::start().await;
    let raw = account_manifest(false);
    serve_manifest(&server, &raw).await;

    let host = ScriptedHost::new(vec![]);
    let stats = host.stats();
    let resolved = RequestBuilder::new(&host)
        .manifest_url(format!("{}/manifests/bank/manifest.json", server.uri()))
        .build()
        .await
        .unwrap();

    assert_json_eq!(serde_json::to_value(&resolved).unwrap(), raw);
    assert_eq!(stats.opened(), 0);
}

#[tokio::test]
async fn captured_session_fills_every_placeholder() {
    let host = ScriptedHost::new(vec![ScriptedStep::Capture(logged_in())]);
    let stats = host.stats();
    let manifest = Manifest::from_value(account_manifest(true)).unwrap();

    let resolved = RequestBuilder::new(&host)
        .manifest(manifest)
        .build()
        .await
        .unwrap();

    assert_json_eq!(
        serde_json::to_value(&resolved.request).unwrap(),
        json!({
            "method": "GET",
            "url": "https://bank.example/api/balance?token=abc123",
            "headers": { "Cookie": "session=s-42" },
            "body": null
        })
    );
    assert!(resolved.is_resolved());
    assert_eq!(resolved.prepare_url.as_deref(), Some("https://bank.example/login"));
    assert_eq!(stats.targets()[0].url, "https://bank.example/login");
    assert_eq!(stats.closed(), 1);
}

#[tokio::test]
async fn companion_script_runs_in_the_surface() {
    let server = MockServer::start().await;
    serve_manifest(&server, &account_manifest(true)).await;
    Mock::given(method("GET"))
        .and(path("/manifests/bank/prepare.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("collectToken()"))
        .mount(&server)
        .await;

    let host = ScriptedHost::new(vec![ScriptedStep::Capture(RawCapture {
        cookies: vec![CookieRecord::new("session", "s-42")],
        dom: "<p>no token rendered yet</p>".into(),
    })])
    .with_script_reply(ScriptReply::Value(json!({ "vars": { "token": "token=fromjs" } })));
    let stats = host.stats();

    let resolved = RequestBuilder::new(&host)
        .manifest_url(format!("{}/manifests/bank/manifest.json", server.uri()))
        .build()
        .await
        .unwrap();

    assert_eq!(stats.scripts(), vec!["collectToken()".to_string()]);
    assert_eq!(
        resolved.request.url,
        "https://bank.example/api/balance?token=fromjs"
    );
}

#[tokio::test]
async fn missing_companion_script_is_silent() {
    let server = MockServer::start().await;
    serve_manifest(&server, &account_manifest(true)).await;

    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    let host = ScriptedHost::new(vec![ScriptedStep::Capture(logged_in())]);
    let stats = host.stats();
    let from_url = RequestBuilder::new(&host)
        .manifest_url(format!("{}/manifests/bank/manifest.json", server.uri()))
        .events(&bus)
        .build()
        .await
        .unwrap();

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::CompanionScript { found: false, url } if url.ends_with("/manifests/bank/prepare.js")
    )));
    assert!(stats.scripts().is_empty());

    let inline_host = ScriptedHost::new(vec![ScriptedStep::Capture(logged_in())]);
    let inline = RequestBuilder::new(&inline_host)
        .manifest(Manifest::from_value(account_manifest(true)).unwrap())
        .build()
        .await
        .unwrap();
    assert_eq!(from_url, inline);
}

#[tokio::test]
async fn unreachable_manifest_fails_before_capture() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let host = ScriptedHost::new(vec![ScriptedStep::Capture(logged_in())]);
    let stats = host.stats();
    let err = RequestBuilder::new(&host)
        .manifest_url(format!("{}/manifests/bank/manifest.json", server.uri()))
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, AttestError::Fetch { .. }));
    assert!(err.to_string().contains("404"));
    assert_eq!(stats.opened(), 0);
}

#[tokio::test]
async fn malformed_remote_manifest_is_a_fetch_error() {
    let server = MockServer::start().await;
    let mut raw = account_manifest(true);
    raw["request"]["method"] = json!("FETCH");
    serve_manifest(&server, &raw).await;

    let host = ScriptedHost::new(vec![]);
    let err = RequestBuilder::new(&host)
        .manifest_url(format!("{}/manifests/bank/manifest.json", server.uri()))
        .build()
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FETCH_ERROR");
}

#[tokio::test]
async fn timeout_reports_once_and_tears_down_the_surface() {
    let host = ScriptedHost::new(vec![]);
    let stats = host.stats();
    let bus = EventBus::default();
    let mut rx = bus.subscribe();

    let err = RequestBuilder::new(&host)
        .manifest(Manifest::from_value(account_manifest(true)).unwrap())
        .timeout(Duration::from_millis(100))
        .events(&bus)
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, AttestError::Timeout { after } if after == Duration::from_millis(100)));
    assert_eq!(stats.opened(), 1);
    assert_eq!(stats.released(), 1);

    let events = drain(&mut rx);
    let failures: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::PipelineFailed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(!events
        .iter()
        .any(|e| matches!(e, PipelineEvent::ManifestResolved { .. })));
}

#[tokio::test]
async fn abandoned_build_releases_the_surface() {
    let host = ScriptedHost::new(vec![]);
    let stats = host.stats();
    let manifest = Manifest::from_value(account_manifest(true)).unwrap();

    let mut build = tokio_test::task::spawn(RequestBuilder::new(&host).manifest(manifest).build());
    assert_pending!(build.poll());
    assert_eq!(stats.opened(), 1);
    assert_eq!(stats.released(), 0);

    drop(build);
    assert_eq!(stats.released(), 1);
}

#[tokio::test]
async fn resolution_is_idempotent() {
    let manifest = Manifest::from_value(account_manifest(true)).unwrap();
    let artifacts = CapturedArtifacts::from_raw(logged_in());

    let once = extract::resolve(&manifest, &artifacts).unwrap();
    let twice = extract::resolve(&once, &artifacts).unwrap();
    assert_eq!(once, twice);
    assert_eq!(manifest, Manifest::from_value(account_manifest(true)).unwrap());
}

struct RecordingProver;

#[async_trait]
impl Prover for RecordingProver {
    async fn generate_proof(&self, manifest: &Manifest) -> Result<String, ProverError> {
        if manifest.is_resolved() {
            Ok(format!("proof({})", manifest.request.url))
        } else {
            Err(ProverError::new("UNRESOLVED", "manifest still has placeholders"))
        }
    }
}

#[tokio::test]
async fn proof_from_url_runs_the_whole_pipeline() {
    let server = MockServer::start().await;
    serve_manifest(&server, &account_manifest(true)).await;

    let host = Arc::new(ScriptedHost::new(vec![ScriptedStep::Capture(logged_in())]));
    let orchestrator = ProofOrchestrator::new(host, Arc::new(RecordingProver), PipelineConfig::default());
    let mut rx = orchestrator.events().subscribe();

    let result = orchestrator
        .generate_from_url(&format!("{}/manifests/bank/manifest.json", server.uri()))
        .await
        .unwrap();

    assert_eq!(result.manifest_id, "bank-balance");
    assert_eq!(
        result.proof,
        "proof(https://bank.example/api/balance?token=abc123)"
    );
    let statuses: Vec<ProofStatus> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::ProofStatus { status } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses.last(), Some(&ProofStatus::Generated));
}

#[tokio::test]
async fn proof_fails_when_capture_never_arrives() {
    let host = Arc::new(ScriptedHost::new(vec![]));
    let stats = host.stats();
    let orchestrator = ProofOrchestrator::new(host, Arc::new(RecordingProver), PipelineConfig::default());
    let mut rx = orchestrator.events().subscribe();

    let err = orchestrator
        .generate(
            Manifest::from_value(account_manifest(true)).unwrap(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "TIMEOUT");
    assert_eq!(stats.released(), 1);
    let events = drain(&mut rx);
    assert!(events.contains(&PipelineEvent::ProofStatus {
        status: ProofStatus::Failed
    }));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::PipelineFailed { .. }))
            .count(),
        1
    );
}
