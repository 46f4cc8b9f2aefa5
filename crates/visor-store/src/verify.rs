//! Cookie auto-verification against the site allowlist.
//!
//! A blob is "verified" for a site when the site's required cookies are
//! present on a matching domain and not expired. Sites with no matching
//! cookies stay `false`.

use std::collections::BTreeMap;

use crate::blob::Cookie;

/// Sites eligible for auto-verification.
pub const SITE_ALLOWLIST: &[&str] = &["google", "linkedin", "instagram", "facebook", "tiktok"];

/// Compute the per-site verification map for `cookies` at time `now`.
///
/// When `sites` is empty the whole allowlist is checked; otherwise only the
/// requested sites (unknown names are ignored).
#[must_use]
pub fn verify_cookies(cookies: &[Cookie], sites: &[String], now: f64) -> BTreeMap<String, bool> {
    let targets: Vec<&str> = if sites.is_empty() {
        SITE_ALLOWLIST.to_vec()
    } else {
        sites
            .iter()
            .map(String::as_str)
            .filter(|s| SITE_ALLOWLIST.contains(s))
            .collect()
    };

    let has = |domain_suffix: &str, name: &str| {
        cookies.iter().any(|c| {
            c.name == name && domain_matches(&c.domain, domain_suffix) && !c.is_expired(now)
        })
    };

    let mut map = BTreeMap::new();
    for site in targets {
        let ok = match site {
            "google" => {
                has("google.com", "SID") && has("google.com", "SIDCC") && has("google.com", "OSID")
            }
            "linkedin" => has("linkedin.com", "li_at"),
            "instagram" => has("instagram.com", "sessionid"),
            "facebook" => has("facebook.com", "c_user") && has("facebook.com", "xs"),
            "tiktok" => has("tiktok.com", "sessionid") || has("tiktok.com", "sid_tt"),
            _ => false,
        };
        let _ = map.insert(site.to_string(), ok);
    }
    map
}

/// True when at least one site in the map verified.
#[must_use]
pub fn any_verified(map: &BTreeMap<String, bool>) -> bool {
    map.values().any(|v| *v)
}

fn domain_matches(cookie_domain: &str, suffix: &str) -> bool {
    let d = cookie_domain.trim_start_matches('.').to_ascii_lowercase();
    d == suffix || d.ends_with(&format!(".{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str, domain: &str) -> Cookie {
        Cookie {
            name: name.into(),
            value: "v".into(),
            domain: domain.into(),
            path: "/".into(),
            expires: None,
            http_only: true,
            secure: true,
            same_site: None,
        }
    }

    fn expired(name: &str, domain: &str) -> Cookie {
        Cookie {
            expires: Some(1.0),
            ..cookie(name, domain)
        }
    }

    #[test]
    fn google_requires_all_three() {
        let partial = vec![cookie("SID", ".google.com"), cookie("SIDCC", ".google.com")];
        let map = verify_cookies(&partial, &[], 1000.0);
        assert_eq!(map["google"], false);

        let full = vec![
            cookie("SID", ".google.com"),
            cookie("SIDCC", ".google.com"),
            cookie("OSID", ".docs.google.com"),
        ];
        let map = verify_cookies(&full, &[], 1000.0);
        assert_eq!(map["google"], true);
    }

    #[test]
    fn expired_cookies_do_not_verify() {
        let cookies = vec![
            expired("SID", ".google.com"),
            cookie("SIDCC", ".google.com"),
            cookie("OSID", ".google.com"),
        ];
        let map = verify_cookies(&cookies, &[], 1000.0);
        assert_eq!(map["google"], false);
    }

    #[test]
    fn linkedin_single_cookie() {
        let map = verify_cookies(&[cookie("li_at", ".www.linkedin.com")], &[], 0.0);
        assert_eq!(map["linkedin"], true);
    }

    #[test]
    fn facebook_needs_both() {
        let map = verify_cookies(&[cookie("c_user", ".facebook.com")], &[], 0.0);
        assert_eq!(map["facebook"], false);
        let map = verify_cookies(
            &[cookie("c_user", ".facebook.com"), cookie("xs", ".facebook.com")],
            &[],
            0.0,
        );
        assert_eq!(map["facebook"], true);
    }

    #[test]
    fn tiktok_accepts_either_cookie() {
        let map = verify_cookies(&[cookie("sid_tt", ".tiktok.com")], &[], 0.0);
        assert_eq!(map["tiktok"], true);
        let map = verify_cookies(&[cookie("sessionid", ".www.tiktok.com")], &[], 0.0);
        assert_eq!(map["tiktok"], true);
    }

    #[test]
    fn unrelated_domain_does_not_count() {
        let map = verify_cookies(&[cookie("sessionid", ".notinstagram.com")], &[], 0.0);
        assert_eq!(map["instagram"], false);
    }

    #[test]
    fn requested_sites_limit_the_map() {
        let map = verify_cookies(&[cookie("li_at", ".linkedin.com")], &["linkedin".into()], 0.0);
        assert_eq!(map.len(), 1);
        assert_eq!(map["linkedin"], true);
    }

    #[test]
    fn unknown_requested_site_ignored() {
        let map = verify_cookies(&[], &["myspace".into()], 0.0);
        assert!(map.is_empty());
    }

    #[test]
    fn sites_without_cookies_stay_false() {
        let map = verify_cookies(&[], &[], 0.0);
        assert_eq!(map.len(), SITE_ALLOWLIST.len());
        assert!(map.values().all(|v| !v));
        assert!(!any_verified(&map));
    }

    #[test]
    fn any_verified_detects_single_hit() {
        let map = verify_cookies(&[cookie("sessionid", ".instagram.com")], &[], 0.0);
        assert!(any_verified(&map));
    }
}
