//! C2: URL normalization, fingerprinting, and the follow/skip filter. See
//! spec §3 ("URL Fingerprint") and §4.1.

use url::Url;

use crate::config::CrawlerConfig;

/// Outcome of [`should_follow`]: whether to enqueue the link, and why not if
/// it was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowDecision {
    pub follow: bool,
    pub reason: Option<String>,
}

impl FollowDecision {
    fn follow() -> Self {
        Self {
            follow: true,
            reason: None,
        }
    }

    fn skip(reason: impl Into<String>) -> Self {
        Self {
            follow: false,
            reason: Some(reason.into()),
        }
    }
}

/// Canonicalize a URL into the dedup key described in spec §3:
/// lowercase scheme/host, strip fragment, drop a default port for the
/// scheme, collapse repeated `/`, drop a trailing `/` (except root),
/// and sort query parameters alphabetically (stable for repeated keys).
pub fn fingerprint(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let scheme = parsed.scheme().to_lowercase();
    let host = parsed.host_str()?.to_lowercase();

    let port = parsed.port().filter(|&p| !is_default_port(&scheme, p));

    let mut path = String::new();
    let mut prev_slash = false;
    for c in parsed.path().chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        path.push(c);
    }
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    if path.is_empty() {
        path.push('/');
    }

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut out = String::new();
    out.push_str(&scheme);
    out.push_str("://");
    out.push_str(&host);
    if let Some(p) = port {
        out.push(':');
        out.push_str(&p.to_string());
    }
    out.push_str(&path);
    if !pairs.is_empty() {
        out.push('?');
        let query = pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        out.push_str(&query);
    }
    Some(out)
}

fn is_default_port(scheme: &str, port: u16) -> bool {
    matches!(
        (scheme, port),
        ("http", 80) | ("https", 443) | ("ftp", 21)
    )
}

/// The fingerprint suffixed with `:<depth>`, used only inside the
/// scheduler's seen-set so the same URL re-enqueued at a shallower depth is
/// still treated as a new entry (spec §9 Open Question (a)).
pub fn fingerprint_at_depth(url: &str, depth: u32) -> Option<String> {
    fingerprint(url).map(|fp| format!("{fp}:{depth}"))
}

fn host_matches_or_subdomain(host: &str, target: &str) -> bool {
    host == target || host.ends_with(&format!(".{target}"))
}

/// Decide whether to follow a discovered link, applying the rule table from
/// spec §4.1 in order — first match wins.
pub fn should_follow(
    config: &CrawlerConfig,
    url: &str,
    from_url: Option<&str>,
) -> FollowDecision {
    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => {
            if config.technical_filters.filter_malformed_urls {
                return FollowDecision::skip("Malformed URL");
            }
            return FollowDecision::follow();
        }
    };

    let host = match parsed.host_str() {
        Some(h) => h.to_lowercase(),
        None => {
            if config.technical_filters.filter_malformed_urls {
                return FollowDecision::skip("Malformed URL");
            }
            return FollowDecision::follow();
        }
    };

    if let Some(restrict) = &config.restrict_to_start_domain {
        if !host_matches_or_subdomain(&host, &restrict.to_lowercase()) {
            return FollowDecision::skip(format!(
                "host {host} is outside the restricted start domain {restrict}"
            ));
        }
    }

    if config.technical_filters.filter_long_urls
        && url.len() > config.technical_filters.max_url_length
    {
        return FollowDecision::skip(format!(
            "URL length {} exceeds max {}",
            url.len(),
            config.technical_filters.max_url_length
        ));
    }

    if config.technical_filters.filter_unsupported_schemes
        && !config
            .allowed_protocols
            .iter()
            .any(|p| p.eq_ignore_ascii_case(parsed.scheme()))
    {
        return FollowDecision::skip(format!("unsupported scheme {}", parsed.scheme()));
    }

    if !config.allowed_domains.is_empty()
        && !config
            .allowed_domains
            .iter()
            .any(|d| host_matches_or_subdomain(&host, &d.to_lowercase()))
    {
        return FollowDecision::skip(format!("host {host} not in allowed domains"));
    }

    if config
        .blocked_domains
        .iter()
        .any(|d| host_matches_or_subdomain(&host, &d.to_lowercase()))
    {
        return FollowDecision::skip(format!("host {host} is blocked"));
    }

    if let Some(pattern) = config
        .custom_url_filters
        .iter()
        .find(|re| re.is_match(url))
    {
        return FollowDecision::skip(format!("matched custom filter {}", pattern.as_str()));
    }

    if let Some(from) = from_url {
        if let Ok(from_parsed) = Url::parse(from) {
            let same_page = from_parsed.host_str() == parsed.host_str()
                && from_parsed.path() == parsed.path()
                && from_parsed.query() == parsed.query();
            if same_page && parsed.fragment().is_some_and(|f| !f.is_empty()) {
                return FollowDecision::skip("fragment-only link to same page");
            }
        }
    }

    let lower_path = parsed.path().to_lowercase();
    if let Some((_, category)) = config
        .active_skip_extensions()
        .iter()
        .find(|(ext, _)| lower_path.ends_with(&format!(".{ext}")))
    {
        return FollowDecision::skip(format!("skipped {category} file extension"));
    }

    FollowDecision::follow()
}
