//! Variable extraction and injection.
//!
//! Pure transformation: given a manifest and a capture, produce a new
//! manifest whose request template has every placeholder filled.
//!
//! Source text per variable, first available wins:
//! 1. a value supplied by the preparation script (`vars`)
//! 2. the cookie of the same name, when the rule's `type` is `cookie`
//! 3. the DOM snapshot
//!
//! When a rule has a regex, the first match is taken (group 1 when the
//! pattern has groups, else the whole match). Without a regex, script and
//! cookie values are used verbatim; the DOM is never used whole.

use crate::capture::CapturedArtifacts;
use crate::error::{AttestError, AttestResult, ExtractionReason};
use crate::manifest::template::{self, substitute};
use crate::manifest::{Manifest, RequestOverride, RequestTemplate, VariableRule};
use crate::prepare::{run_preparation, PreparationOutcome, PreparationScript, ScriptContext};
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

/// Resolve `manifest` against `artifacts`.
///
/// The output keeps `prepareUrl` for audit, drops `vars`, and has the
/// request override merged in. Placeholders are checked against the
/// template, so extracted values may themselves contain `{{...}}` text;
/// they are inserted verbatim. Running it again on its own output returns
/// the same manifest, unless such a value was inserted.
pub fn resolve(manifest: &Manifest, artifacts: &CapturedArtifacts) -> AttestResult<Manifest> {
    let values = extract_values(manifest, artifacts)?;

    if let Some(name) = manifest
        .placeholders()
        .into_iter()
        .find(|name| !values.contains_key(name))
    {
        return Err(AttestError::extraction(
            name,
            ExtractionReason::UnresolvedPlaceholder,
        ));
    }

    let mut resolved = manifest.clone();
    resolved.request = inject(&manifest.request, &values)?;

    debug!(manifest_id = %manifest.id, variables = values.len(), "manifest resolved");
    Ok(resolved)
}

/// Run the preparation script in `ctx`, then resolve against the
/// (possibly annotated) capture. A failing script is reported in the
/// outcome and resolution proceeds on the raw capture.
pub async fn resolve_prepared(
    ctx: &mut dyn ScriptContext,
    manifest: &Manifest,
    artifacts: CapturedArtifacts,
    script: Option<&PreparationScript>,
) -> (AttestResult<Manifest>, PreparationOutcome) {
    let (artifacts, outcome) = run_preparation(ctx, script, artifacts).await;
    (resolve(manifest, &artifacts), outcome)
}

/// Extract every declared variable.
pub fn extract_values(
    manifest: &Manifest,
    artifacts: &CapturedArtifacts,
) -> AttestResult<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    let Some(rules) = &manifest.request.vars else {
        return Ok(values);
    };
    for (name, rule) in rules {
        let value = extract_one(name, rule, artifacts)?;
        values.insert(name.clone(), value);
    }
    Ok(values)
}

fn extract_one(name: &str, rule: &VariableRule, artifacts: &CapturedArtifacts) -> AttestResult<String> {
    let script_value = artifacts.vars.get(name).map(String::as_str);
    let cookie_value = if rule.targets_cookie() {
        artifacts.cookie_value(name)
    } else {
        None
    };

    let value = match &rule.regex {
        Some(pattern) => {
            let re = Regex::new(pattern).map_err(|e| {
                AttestError::extraction(name, ExtractionReason::InvalidPattern(e.to_string()))
            })?;
            let source = match (script_value, cookie_value) {
                (Some(v), _) | (None, Some(v)) => v,
                (None, None) if rule.targets_cookie() => {
                    return Err(AttestError::extraction(name, ExtractionReason::MissingSource));
                }
                (None, None) => artifacts.dom.as_str(),
            };
            first_match(&re, source)
                .ok_or_else(|| AttestError::extraction(name, ExtractionReason::NoMatch))?
        }
        None => script_value
            .or(cookie_value)
            .map(str::to_string)
            .ok_or_else(|| AttestError::extraction(name, ExtractionReason::MissingSource))?,
    };

    if let Some(max) = rule.length {
        let actual = value.chars().count();
        if actual > max {
            return Err(AttestError::extraction(
                name,
                ExtractionReason::TooLong { max, actual },
            ));
        }
    }
    Ok(value)
}

fn first_match(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    let m = if re.captures_len() > 1 {
        caps.get(1)?
    } else {
        caps.get(0)?
    };
    Some(m.as_str().to_string())
}

/// Substitute values into the template, then merge the override onto it.
/// Override headers replace base headers of the same name.
fn inject(
    request: &RequestTemplate,
    values: &BTreeMap<String, String>,
) -> AttestResult<RequestTemplate> {
    let mut out = RequestTemplate {
        method: request.method,
        url: substitute(&request.url, values),
        headers: substitute_headers(&request.headers, values)?,
        body: request.body.as_deref().map(|b| substitute(b, values)),
        vars: None,
        extra: None,
    };

    if let Some(extra) = &request.extra {
        merge_override(&mut out, extra, values)?;
    }
    Ok(out)
}

fn merge_override(
    out: &mut RequestTemplate,
    extra: &RequestOverride,
    values: &BTreeMap<String, String>,
) -> AttestResult<()> {
    if let Some(method) = extra.method {
        out.method = method;
    }
    if let Some(url) = &extra.url {
        out.url = substitute(url, values);
    }
    if let Some(headers) = &extra.headers {
        out.headers.extend(substitute_headers(headers, values)?);
    }
    if let Some(body) = &extra.body {
        out.body = Some(substitute(body, values));
    }
    Ok(())
}

/// Two templated names that substitute to the same header are an error.
fn substitute_headers(
    headers: &BTreeMap<String, String>,
    values: &BTreeMap<String, String>,
) -> AttestResult<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        let resolved = substitute(name, values);
        if out.contains_key(&resolved) {
            return Err(AttestError::extraction(
                resolved,
                ExtractionReason::HeaderCollision,
            ));
        }
        out.insert(resolved, substitute(value, values));
    }
    Ok(out)
}

/// Names referenced by placeholders that no rule declares.
pub fn undeclared_placeholders(manifest: &Manifest) -> Vec<String> {
    let declared = manifest.request.vars.as_ref();
    manifest
        .request
        .templated_fields()
        .flat_map(template::placeholders)
        .filter(|name| declared.map_or(true, |d| !d.contains_key(*name)))
        .map(str::to_string)
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CookieRecord;
    use crate::manifest::Method;
    use serde_json::json;

    fn manifest(request: serde_json::Value) -> Manifest {
        Manifest::from_value(json!({
            "manifestVersion": "1",
            "id": "m",
            "title": "T",
            "description": "",
            "prepareUrl": "https://example.com/login",
            "request": request,
            "response": { "status": "200", "headers": {}, "body": { "json": ["a"] } }
        }))
        .unwrap()
    }

    fn dom(text: &str) -> CapturedArtifacts {
        CapturedArtifacts {
            dom: text.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_token_from_dom() {
        let m = manifest(json!({
            "method": "POST",
            "url": "https://example.com/api?t={{token}}",
            "headers": { "Authorization": "Bearer {{token}}" },
            "body": "{\"token\": \"{{token}}\"}",
            "vars": { "token": { "regex": "token=(\\w+)", "length": 64 } }
        }));
        let out = resolve(&m, &dom("<script>var x = 'token=abc123';</script>")).unwrap();
        assert_eq!(out.request.url, "https://example.com/api?t=abc123");
        assert_eq!(out.request.headers["Authorization"], "Bearer abc123");
        assert_eq!(out.request.body.as_deref(), Some("{\"token\": \"abc123\"}"));
        assert!(out.request.vars.is_none());
        assert_eq!(out.prepare_url, m.prepare_url);
        assert!(out.is_resolved());
    }

    #[test]
    fn test_first_match_wins() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/{{id}}", "headers": {}, "body": null,
            "vars": { "id": { "regex": "id=(\\d+)" } }
        }));
        let out = resolve(&m, &dom("id=1 id=2")).unwrap();
        assert_eq!(out.request.url, "https://x/1");
    }

    #[test]
    fn test_whole_match_without_group() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/{{id}}", "headers": {}, "body": null,
            "vars": { "id": { "regex": "\\d{3}" } }
        }));
        let out = resolve(&m, &dom("abc 12345")).unwrap();
        assert_eq!(out.request.url, "https://x/123");
    }

    #[test]
    fn test_no_match() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/{{token}}", "headers": {}, "body": null,
            "vars": { "token": { "regex": "token=(\\w+)" } }
        }));
        match resolve(&m, &dom("nothing here")) {
            Err(AttestError::Extraction { variable, reason }) => {
                assert_eq!(variable, "token");
                assert_eq!(reason, ExtractionReason::NoMatch);
            }
            other => panic!("expected NoMatch, got {other:?}"),
        }
    }

    #[test]
    fn test_too_long() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/{{token}}", "headers": {}, "body": null,
            "vars": { "token": { "regex": "token=(\\w+)", "length": 4 } }
        }));
        match resolve(&m, &dom("token=abcdef")) {
            Err(AttestError::Extraction { reason, .. }) => {
                assert_eq!(reason, ExtractionReason::TooLong { max: 4, actual: 6 })
            }
            other => panic!("expected TooLong, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_pattern() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/{{t}}", "headers": {}, "body": null,
            "vars": { "t": { "regex": "(" } }
        }));
        assert!(matches!(
            resolve(&m, &dom("x")),
            Err(AttestError::Extraction {
                reason: ExtractionReason::InvalidPattern(_),
                ..
            })
        ));
    }

    #[test]
    fn test_unresolved_placeholder() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/{{user}}", "headers": {}, "body": null
        }));
        match resolve(&m, &dom("")) {
            Err(AttestError::Extraction { variable, reason }) => {
                assert_eq!(variable, "user");
                assert_eq!(reason, ExtractionReason::UnresolvedPlaceholder);
            }
            other => panic!("expected UnresolvedPlaceholder, got {other:?}"),
        }
        assert_eq!(undeclared_placeholders(&m), vec!["user".to_string()]);
    }

    #[test]
    fn test_cookie_source() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/me", "headers": { "Cookie": "session={{session}}" }, "body": null,
            "vars": {
                "session": { "type": "cookie" },
                "csrf": { "type": "cookie", "regex": "^([a-f0-9]+)\\|" }
            },
            "extra": { "headers": { "X-Csrf": "{{csrf}}" } }
        }));
        let mut a = dom("<html>session=fromdom</html>");
        a.cookies.insert("session".into(), CookieRecord::new("session", "s3cr3t"));
        a.cookies.insert("csrf".into(), CookieRecord::new("csrf", "beef|1700000000"));
        let out = resolve(&m, &a).unwrap();
        assert_eq!(out.request.headers["Cookie"], "session=s3cr3t");
        assert_eq!(out.request.headers["X-Csrf"], "beef");
    }

    #[test]
    fn test_missing_cookie() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/{{session}}", "headers": {}, "body": null,
            "vars": { "session": { "type": "cookie", "regex": ".+" } }
        }));
        assert!(matches!(
            resolve(&m, &dom("session=x")),
            Err(AttestError::Extraction {
                reason: ExtractionReason::MissingSource,
                ..
            })
        ));
    }

    #[test]
    fn test_dom_without_regex_is_missing_source() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/{{a}}", "headers": {}, "body": null,
            "vars": { "a": {} }
        }));
        assert!(matches!(
            resolve(&m, &dom("abc")),
            Err(AttestError::Extraction {
                reason: ExtractionReason::MissingSource,
                ..
            })
        ));
    }

    #[test]
    fn test_script_var_takes_precedence() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/{{uid}}", "headers": {}, "body": null,
            "vars": { "uid": { "regex": "u(\\d+)" } }
        }));
        let mut a = dom("u1");
        a.vars.insert("uid".into(), "u99".into());
        let out = resolve(&m, &a).unwrap();
        assert_eq!(out.request.url, "https://x/99");
    }

    #[test]
    fn test_override_merge() {
        let m = manifest(json!({
            "method": "GET",
            "url": "https://x/a",
            "headers": { "Accept": "text/html", "X-Base": "1" },
            "body": null,
            "vars": { "t": { "regex": "t=(\\w+)" } },
            "extra": {
                "method": "POST",
                "headers": { "Accept": "application/json" },
                "body": "{\"t\":\"{{t}}\"}"
            }
        }));
        let out = resolve(&m, &dom("t=zz")).unwrap();
        assert_eq!(out.request.method, Method::Post);
        assert_eq!(out.request.url, "https://x/a");
        assert_eq!(out.request.headers["Accept"], "application/json");
        assert_eq!(out.request.headers["X-Base"], "1");
        assert_eq!(out.request.body.as_deref(), Some("{\"t\":\"zz\"}"));
        assert!(out.request.extra.is_none());
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/{{t}}", "headers": {}, "body": null,
            "vars": { "t": { "regex": "t=(\\w+)" } }
        }));
        let a = dom("t=abc");
        let once = resolve(&m, &a).unwrap();
        let twice = resolve(&once, &a).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_input_is_not_mutated() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/{{t}}", "headers": {}, "body": null,
            "vars": { "t": { "regex": "t=(\\w+)" } }
        }));
        let before = m.clone();
        let _ = resolve(&m, &dom("t=abc")).unwrap();
        assert_eq!(m, before);
    }

    #[test]
    fn test_length_counts_chars() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/{{n}}", "headers": {}, "body": null,
            "vars": { "n": { "regex": "name=(\\S+)", "length": 4 } }
        }));
        let out = resolve(&m, &dom("name=żółw")).unwrap();
        assert_eq!(out.request.url, "https://x/żółw");
    }

    struct FailingScript;

    #[async_trait::async_trait]
    impl ScriptContext for FailingScript {
        async fn evaluate(&mut self, _script: &str) -> AttestResult<serde_json::Value> {
            Err(AttestError::CaptureFailure("ReferenceError: collect is not defined".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_script_still_resolves_capture() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/{{t}}", "headers": {}, "body": null,
            "vars": { "t": { "regex": "t=(\\w+)" } }
        }));
        let script = PreparationScript::new("collect()");
        let (out, outcome) =
            resolve_prepared(&mut FailingScript, &m, dom("t=abc"), Some(&script)).await;
        assert!(matches!(outcome, PreparationOutcome::Failed(_)));
        assert_eq!(out.unwrap().request.url, "https://x/abc");
    }

    #[test]
    fn test_value_with_braces_is_inserted_verbatim() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/search?q={{q}}", "headers": {}, "body": null,
            "vars": { "q": { "regex": "q=(\\S+)" } }
        }));
        let out = resolve(&m, &dom("<input value q={{x}}>")).unwrap();
        assert_eq!(out.request.url, "https://x/search?q={{x}}>");
    }

    #[test]
    fn test_header_names_colliding_after_substitution() {
        let m = manifest(json!({
            "method": "GET", "url": "https://x/", "body": null,
            "headers": { "X-{{kind}}": "a", "X-Token": "b" },
            "vars": { "kind": { "regex": "kind=(\\w+)" } }
        }));
        match resolve(&m, &dom("kind=Token")) {
            Err(AttestError::Extraction { variable, reason }) => {
                assert_eq!(variable, "X-Token");
                assert_eq!(reason, ExtractionReason::HeaderCollision);
            }
            other => panic!("expected HeaderCollision, got {other:?}"),
        }
    }
}
