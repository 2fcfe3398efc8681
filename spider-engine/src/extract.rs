//! HTML link extraction.

use scraper::{Html, Selector};
use url::Url;

/// Links, form count and title pulled out of one HTML document.
#[derive(Debug, Default)]
pub struct Extracted {
    pub links: Vec<Url>,
    pub forms_found: u32,
    pub title: Option<String>,
}

/// Attribute sources the spider expands.
const LINK_SELECTORS: &[(&str, &str)] = &[
    ("a[href]", "href"),
    ("form[action]", "action"),
    ("script[src]", "src"),
    ("link[href]", "href"),
    ("img[src]", "src"),
];

/// Extract candidate URLs from an HTML body, resolving relative
/// references against `base`. Only http(s) results are returned.
pub fn extract_links(html: &str, base: &Url) -> Extracted {
    let document = Html::parse_document(html);
    let mut out = Extracted::default();

    if let Ok(selector) = Selector::parse("title") {
        out.title = document
            .select(&selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty());
    }

    if let Ok(selector) = Selector::parse("form") {
        out.forms_found = document.select(&selector).count() as u32;
    }

    for (css, attribute) in LINK_SELECTORS {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        for element in document.select(&selector) {
            let Some(value) = element.value().attr(attribute) else {
                continue;
            };
            let Ok(resolved) = base.join(value) else {
                continue;
            };
            if matches!(resolved.scheme(), "http" | "https") {
                out.links.push(resolved);
            }
        }
    }

    out
}
