//! Plaintext storage-state blob types and cookie hygiene.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single browser cookie as captured from the session.
///
/// Partitioned (CHIPS) cookies are carried without their partition key: the
/// cookie surface used for extraction does not expose it, so sites that
/// require partitioning will not resume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// Cookie domain (leading dot preserved).
    pub domain: String,
    /// Cookie path.
    #[serde(default = "default_path")]
    pub path: String,
    /// Expiry as seconds since epoch; `None` or negative means session cookie.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    /// HttpOnly flag.
    #[serde(default)]
    pub http_only: bool,
    /// Secure flag.
    #[serde(default)]
    pub secure: bool,
    /// SameSite attribute, normalized to `Lax` / `Strict` / `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

impl Cookie {
    /// Whether the cookie is expired at `now` (seconds since epoch).
    ///
    /// Session cookies (no expiry, or a negative sentinel) never expire here.
    #[must_use]
    pub fn is_expired(&self, now: f64) -> bool {
        match self.expires {
            Some(expires) if expires >= 0.0 => expires <= now,
            _ => false,
        }
    }
}

/// One `localStorage` entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalStorageItem {
    /// Storage key.
    pub name: String,
    /// Storage value.
    pub value: String,
}

/// Local storage captured for one origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OriginState {
    /// The origin, e.g. `https://docs.google.com`.
    pub origin: String,
    /// Entries for that origin.
    #[serde(rename = "localStorage", default)]
    pub local_storage: Vec<LocalStorageItem>,
}

/// The plaintext storage-state blob as encrypted into an envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStateBlob {
    /// Captured cookies.
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    /// Per-origin local storage. Extraction is scoped to the origin that was
    /// current at capture time; cross-origin storage is not captured.
    #[serde(default)]
    pub origins: Vec<OriginState>,
    /// Environment fingerprint of the capturing browser (user agent,
    /// timezone, viewport, languages, device pixel ratio).
    #[serde(rename = "__envMetadata", default, skip_serializing_if = "Option::is_none")]
    pub env_metadata: Option<Value>,
}

impl StorageStateBlob {
    /// Drop cookies already expired at `now`, returning the removed count.
    pub fn filter_expired(&mut self, now: f64) -> usize {
        let before = self.cookies.len();
        self.cookies.retain(|c| !c.is_expired(now));
        before - self.cookies.len()
    }
}

/// Normalize cookies arriving from an upload or extension capture.
///
/// Accepts the `expirationDate` alias for `expires`, normalizes `sameSite`
/// casing, drops entries missing name/value/domain, and dedups by
/// (domain, path, name) keeping the longest-lived duplicate.
#[must_use]
pub fn normalize_cookies(raw: &[Value]) -> Vec<Cookie> {
    use std::collections::HashMap;

    let mut dedup: HashMap<(String, String, String), Cookie> = HashMap::new();
    for entry in raw {
        let Some(obj) = entry.as_object() else {
            continue;
        };
        let Some(name) = obj.get("name").and_then(Value::as_str) else {
            continue;
        };
        let Some(value) = obj.get("value").and_then(Value::as_str) else {
            continue;
        };
        let Some(domain) = obj.get("domain").and_then(Value::as_str) else {
            continue;
        };
        let path = obj
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or("/")
            .to_string();
        let expires = obj
            .get("expires")
            .and_then(Value::as_f64)
            .or_else(|| obj.get("expirationDate").and_then(Value::as_f64));
        let cookie = Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: path.clone(),
            expires,
            http_only: obj.get("httpOnly").and_then(Value::as_bool).unwrap_or(false),
            secure: obj.get("secure").and_then(Value::as_bool).unwrap_or(false),
            same_site: obj
                .get("sameSite")
                .and_then(Value::as_str)
                .and_then(normalize_same_site),
        };
        let key = (domain.to_ascii_lowercase(), path, name.to_string());
        match dedup.get(&key) {
            Some(prev)
                if prev.expires.unwrap_or(0.0) >= cookie.expires.unwrap_or(0.0) => {}
            _ => {
                let _ = dedup.insert(key, cookie);
            }
        }
    }
    let mut cookies: Vec<Cookie> = dedup.into_values().collect();
    cookies.sort_by(|a, b| (&a.domain, &a.path, &a.name).cmp(&(&b.domain, &b.path, &b.name)));
    cookies
}

fn normalize_same_site(raw: &str) -> Option<String> {
    match raw.to_ascii_lowercase().as_str() {
        "lax" => Some("Lax".to_string()),
        "strict" => Some("Strict".to_string()),
        "none" | "no_restriction" => Some("None".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cookie(name: &str, domain: &str, expires: Option<f64>) -> Cookie {
        Cookie {
            name: name.into(),
            value: "v".into(),
            domain: domain.into(),
            path: "/".into(),
            expires,
            http_only: false,
            secure: true,
            same_site: None,
        }
    }

    #[test]
    fn session_cookie_never_expires() {
        assert!(!cookie("SID", ".google.com", None).is_expired(1e12));
        assert!(!cookie("SID", ".google.com", Some(-1.0)).is_expired(1e12));
    }

    #[test]
    fn past_expiry_is_expired() {
        assert!(cookie("SID", ".google.com", Some(100.0)).is_expired(200.0));
        assert!(!cookie("SID", ".google.com", Some(300.0)).is_expired(200.0));
    }

    #[test]
    fn filter_expired_removes_only_stale() {
        let mut blob = StorageStateBlob {
            cookies: vec![
                cookie("fresh", ".a.com", Some(1000.0)),
                cookie("stale", ".a.com", Some(10.0)),
                cookie("session", ".a.com", None),
            ],
            ..Default::default()
        };
        let removed = blob.filter_expired(500.0);
        assert_eq!(removed, 1);
        let names: Vec<_> = blob.cookies.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["fresh", "session"]);
    }

    #[test]
    fn blob_serializes_wire_keys() {
        let blob = StorageStateBlob {
            cookies: vec![cookie("SID", ".google.com", Some(1.0))],
            origins: vec![OriginState {
                origin: "https://docs.google.com".into(),
                local_storage: vec![LocalStorageItem {
                    name: "k".into(),
                    value: "v".into(),
                }],
            }],
            env_metadata: Some(json!({"userAgent": "x"})),
        };
        let v = serde_json::to_value(&blob).unwrap();
        assert!(v["cookies"][0].get("httpOnly").is_some());
        assert!(v["origins"][0].get("localStorage").is_some());
        assert!(v.get("__envMetadata").is_some());
    }

    #[test]
    fn blob_roundtrip() {
        let blob = StorageStateBlob {
            cookies: vec![cookie("a", ".x.com", None)],
            origins: vec![],
            env_metadata: None,
        };
        let json = serde_json::to_string(&blob).unwrap();
        let back: StorageStateBlob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn normalize_accepts_expiration_date_alias() {
        let raw = vec![json!({
            "name": "li_at", "value": "t", "domain": ".linkedin.com",
            "expirationDate": 2000000000.0
        })];
        let cookies = normalize_cookies(&raw);
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].expires, Some(2_000_000_000.0));
    }

    #[test]
    fn normalize_same_site_casing() {
        let raw = vec![
            json!({"name": "a", "value": "1", "domain": ".x.com", "sameSite": "lax"}),
            json!({"name": "b", "value": "1", "domain": ".x.com", "sameSite": "no_restriction"}),
            json!({"name": "c", "value": "1", "domain": ".x.com", "sameSite": "weird"}),
        ];
        let cookies = normalize_cookies(&raw);
        assert_eq!(cookies[0].same_site.as_deref(), Some("Lax"));
        assert_eq!(cookies[1].same_site.as_deref(), Some("None"));
        assert_eq!(cookies[2].same_site, None);
    }

    #[test]
    fn normalize_dedups_keeping_longest_lived() {
        let raw = vec![
            json!({"name": "SID", "value": "old", "domain": ".google.com", "expires": 100.0}),
            json!({"name": "SID", "value": "new", "domain": ".google.com", "expires": 900.0}),
        ];
        let cookies = normalize_cookies(&raw);
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].value, "new");
    }

    #[test]
    fn normalize_drops_incomplete_entries() {
        let raw = vec![
            json!({"name": "ok", "value": "1", "domain": ".x.com"}),
            json!({"name": "no_domain", "value": "1"}),
            json!({"value": "no_name", "domain": ".x.com"}),
            json!("not an object"),
        ];
        let cookies = normalize_cookies(&raw);
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "ok");
    }
}
