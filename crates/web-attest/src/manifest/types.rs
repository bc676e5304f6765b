//! Wire types for capture manifests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A declarative template describing the request to notarize, the response
/// to expect, and how to fill the request's variables from a live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub manifest_version: String,
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Page the user must authenticate on. Presence means a browser capture
    /// is required before the request can be resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    pub request: RequestTemplate,
    pub response: ResponseTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_logs: Option<Vec<String>>,
}

/// HTTP request template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub method: Method,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<BTreeMap<String, VariableRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<RequestOverride>,
}

/// Partial request merged onto the base template after extraction.
///
/// A `null` body is indistinguishable from an absent one and leaves the base
/// body untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Extraction directive for a single request variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableRule {
    /// Semantic tag. `cookie` makes the cookie of the same name the source.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// Maximum length of the extracted value, in characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

impl VariableRule {
    /// Whether the rule's source is a cookie rather than the DOM.
    pub fn targets_cookie(&self) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|k| k.eq_ignore_ascii_case("cookie"))
    }
}

/// Expected response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseTemplate {
    /// Expected status, compared as an exact string.
    pub status: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<Vec<String>>,
    #[serde(default)]
    pub body: ResponseBody,
}

/// Body extraction descriptor: an ordered list of JSON-path-like selectors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    #[serde(default)]
    pub json: Vec<String>,
}

/// Supported HTTP methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl Method {
    pub const ALL: [Method; 5] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Patch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Notarization strategy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "TLSN")]
    Tlsn,
    Origo,
    #[serde(rename = "TEE")]
    Tee,
    Proxy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_wire_names() {
        assert_eq!(serde_json::to_string(&Method::Patch).unwrap(), "\"PATCH\"");
        assert_eq!("DELETE".parse::<Method>().unwrap(), Method::Delete);
        assert!("get".parse::<Method>().is_err());
    }

    #[test]
    fn test_mode_wire_names() {
        let modes: Vec<Mode> =
            serde_json::from_str(r#"["TLSN", "Origo", "TEE", "Proxy"]"#).unwrap();
        assert_eq!(modes, vec![Mode::Tlsn, Mode::Origo, Mode::Tee, Mode::Proxy]);
    }

    #[test]
    fn test_cookie_rule_tag_is_case_insensitive() {
        let rule = VariableRule {
            kind: Some("Cookie".into()),
            ..Default::default()
        };
        assert!(rule.targets_cookie());
        assert!(!VariableRule::default().targets_cookie());
    }
}
