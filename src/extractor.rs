//! Collaborator contract for turning a fetched page into links and
//! structured page data, plus the default `scraper`-backed adapter. See
//! spec §4.11 and §4.6.

use std::collections::HashMap;

use scraper::{Html, Selector};
use url::Url;

use crate::types::PageData;

/// Output of one extraction pass: the links discovered on the page, already
/// resolved against the page's own URL.
#[derive(Debug, Clone, Default)]
pub struct ExtractedLinks {
    pub links: Vec<String>,
}

/// Collaborator contract for link and metadata extraction. The default is
/// [`ScraperLinkExtractor`]; a consumer may substitute a JS-rendering
/// extractor or a domain-specific scraper without touching the worker pool.
pub trait PageExtractor: Send + Sync {
    fn extract_links(&self, base_url: &str, html: &str, respect_no_follow: bool) -> ExtractedLinks;
    fn extract_page_data(&self, url: &str, html: &str, status_code: u16, headers: &HashMap<String, String>) -> PageData;
}

/// Default adapter over the `scraper` crate (the teacher's own HTML stack).
pub struct ScraperLinkExtractor;

impl ScraperLinkExtractor {
    fn resolve(base: &Url, href: &str) -> Option<String> {
        base.join(href).ok().map(|u| u.to_string())
    }
}

impl PageExtractor for ScraperLinkExtractor {
    fn extract_links(&self, base_url: &str, html: &str, respect_no_follow: bool) -> ExtractedLinks {
        let Ok(base) = Url::parse(base_url) else {
            return ExtractedLinks::default();
        };
        let document = Html::parse_document(html);
        let selector = Selector::parse("a[href]").expect("static selector is valid");

        let mut links = Vec::new();
        for element in document.select(&selector) {
            if respect_no_follow {
                if let Some(rel) = element.value().attr("rel") {
                    if rel.split_whitespace().any(|token| token.eq_ignore_ascii_case("nofollow")) {
                        continue;
                    }
                }
            }
            if let Some(href) = element.value().attr("href") {
                if let Some(resolved) = Self::resolve(&base, href) {
                    links.push(resolved);
                }
            }
        }

        ExtractedLinks { links }
    }

    fn extract_page_data(&self, url: &str, html: &str, status_code: u16, headers: &HashMap<String, String>) -> PageData {
        let document = Html::parse_document(html);

        let title = Selector::parse("title")
            .ok()
            .and_then(|sel| document.select(&sel).next())
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty());

        let mut metadata = HashMap::new();
        if let Ok(meta_selector) = Selector::parse("meta[name][content]") {
            for el in document.select(&meta_selector) {
                if let (Some(name), Some(content)) = (el.value().attr("name"), el.value().attr("content")) {
                    metadata.insert(name.to_string(), content.to_string());
                }
            }
        }

        PageData {
            url: url.to_string(),
            html: html.to_string(),
            title,
            metadata,
            common_metadata: None,
            status_code,
            headers: headers.clone(),
            fetched_at: chrono::Utc::now(),
            scrape_duration_ms: 0,
            depth: 0,
            extracted_data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_resolved_against_base_url() {
        let extractor = ScraperLinkExtractor;
        let html = r#"<html><body><a href="/child">x</a><a href="https://other.example/page">y</a></body></html>"#;
        let result = extractor.extract_links("https://site.example/dir/page", html, false);
        assert!(result.links.contains(&"https://site.example/child".to_string()));
        assert!(result.links.contains(&"https://other.example/page".to_string()));
    }

    #[test]
    fn nofollow_links_are_skipped_when_respected() {
        let extractor = ScraperLinkExtractor;
        let html = r#"<a href="/a" rel="nofollow">a</a><a href="/b">b</a>"#;
        let result = extractor.extract_links("https://site.example", html, true);
        assert_eq!(result.links, vec!["https://site.example/b".to_string()]);
    }

    #[test]
    fn title_and_metadata_are_extracted() {
        let extractor = ScraperLinkExtractor;
        let html = r#"<html><head><title>  Hello  </title><meta name="description" content="desc"></head></html>"#;
        let data = extractor.extract_page_data("https://site.example", html, 200, &HashMap::new());
        assert_eq!(data.title, Some("Hello".to_string()));
        assert_eq!(data.metadata.get("description"), Some(&"desc".to_string()));
    }
}
