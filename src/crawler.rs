use anyhow::{anyhow, Result};
use chromiumoxide::{Browser, BrowserConfig, Page};
use colored::*;
use futures_util::StreamExt;
use kuchiki::traits::TendrilSink;
use kuchiki::NodeRef;
use scraper::{Html, Selector};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::CrawlConfig;
use crate::fetcher::ResourceFetcher;
use crate::filename::derive_filename;

/// Unique absolute URLs discovered on the seed page, processed in
/// sorted order so runs are reproducible.
pub type LinkSet = BTreeSet<String>;

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SETTLE_MAX_WAIT: Duration = Duration::from_secs(10);
/// Fixed delay used when the readiness poll itself cannot run.
const SETTLE_FALLBACK_DELAY: Duration = Duration::from_secs(5);

/// Concatenates the text of every rule in every accessible stylesheet.
/// Sheets blocked by cross-origin policy are skipped.
const COLLECT_CSS_SCRIPT: &str = r#"
    (() => {
        let styles = '';
        for (const sheet of document.styleSheets) {
            let rules = null;
            try {
                rules = sheet.cssRules || sheet.rules;
            } catch (e) {
                continue;
            }
            if (!rules) continue;
            for (const rule of rules) {
                styles += rule.cssText + '\n';
            }
        }
        return styles;
    })()
"#;

/// Outcome counts for one run. `discovered == 0` means there was
/// nothing to archive; `failed > 0` means some links were skipped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub discovered: usize,
    pub archived: usize,
    pub failed: usize,
}

/// An image reference lifted out of a rendered page: the attribute
/// value as written, and that value resolved against the page's own
/// URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ImageReference {
    original: String,
    resolved: Url,
}

pub struct Crawler {
    config: CrawlConfig,
    fetcher: ResourceFetcher,
}

impl Crawler {
    pub fn new(config: CrawlConfig, fetch_timeout: Duration) -> Result<Self> {
        let fetcher = ResourceFetcher::new(fetch_timeout)?;
        Ok(Self { config, fetcher })
    }

    /// Run the full pipeline: launch a browser session, discover links
    /// on the seed page, archive each one. The session is torn down on
    /// every exit path.
    pub async fn run(&self) -> Result<RunSummary> {
        let config = BrowserConfig::builder()
            .window_size(1920, 1080)
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .build()
            .map_err(|e| anyhow!("Failed to create browser config: {}", e))?;

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| anyhow!("Failed to launch browser: {}", e))?;

        let handle = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(err) = h {
                    // Chrome emits protocol messages chromiumoxide cannot
                    // deserialize; those are noise, not failures.
                    let err_str = err.to_string();
                    if !err_str.contains("data did not match any variant")
                        && !err_str.contains("untagged enum Message")
                    {
                        error!("Browser handler error: {}", err);
                    } else {
                        debug!("Chrome protocol message ignored: {}", err);
                    }
                }
            }
        });

        let result = self.run_internal(&browser).await;

        browser.close().await.ok();
        handle.abort();

        result
    }

    async fn run_internal(&self, browser: &Browser) -> Result<RunSummary> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| anyhow!("Failed to create new page: {}", e))?;

        let links = self.discover_links(&page).await;

        if links.is_empty() {
            error!(
                "No links matched \"{}\" at {}, nothing to archive",
                self.config.selector,
                self.config.target_url().green()
            );
            return Ok(RunSummary::default());
        }

        info!("Found {} unique links", links.len());

        Ok(self.archive_pages(&page, &links).await)
    }

    /// Load the seed page and collect every link matching the
    /// configured selector. Navigation or query errors degrade to
    /// whatever was accumulated so far, which may be the empty set.
    async fn discover_links(&self, page: &Page) -> LinkSet {
        let target = self.config.target_url();
        info!("Fetching links from: {}", target.green());

        match self.query_links(page, &target).await {
            Ok(links) => links,
            Err(e) => {
                error!("Failed to collect links from {}: {}", target, e);
                LinkSet::new()
            }
        }
    }

    async fn query_links(&self, page: &Page, target: &str) -> Result<LinkSet> {
        page.goto(target)
            .await
            .map_err(|e| anyhow!("Failed to navigate to {}: {}", target, e))?;

        page.wait_for_navigation()
            .await
            .map_err(|e| anyhow!("Failed to wait for navigation: {}", e))?;

        wait_for_settle(page).await;

        let script = link_query_script(&self.config.selector)?;
        let hrefs: Vec<String> = page
            .evaluate(script)
            .await
            .map_err(|e| anyhow!("Failed to query links: {}", e))?
            .into_value()
            .map_err(|e| anyhow!("Failed to read link query result: {}", e))?;

        Ok(filter_links(hrefs))
    }

    async fn archive_pages(&self, page: &Page, links: &LinkSet) -> RunSummary {
        let mut summary = RunSummary {
            discovered: links.len(),
            ..RunSummary::default()
        };

        for url in links {
            match self.archive_page(page, url).await {
                Ok(path) => {
                    info!("Saved: {}", path.display().to_string().blue());
                    summary.archived += 1;
                }
                Err(e) => {
                    error!("Failed to archive {}: {}", url.green(), e);
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    /// Archive one page: render it, capture its stylesheet rules, pull
    /// every image in as a data URI, and write the self-contained
    /// document into the output directory.
    async fn archive_page(&self, page: &Page, url: &str) -> Result<std::path::PathBuf> {
        info!("Fetching: {}", url.green());

        page.goto(url)
            .await
            .map_err(|e| anyhow!("Failed to navigate to {}: {}", url, e))?;

        page.wait_for_navigation()
            .await
            .map_err(|e| anyhow!("Failed to wait for navigation: {}", e))?;

        wait_for_settle(page).await;

        let css: String = page
            .evaluate(COLLECT_CSS_SCRIPT)
            .await
            .map_err(|e| anyhow!("Failed to collect stylesheet rules: {}", e))?
            .into_value()
            .unwrap_or_default();

        let markup = page
            .content()
            .await
            .map_err(|e| anyhow!("Failed to get page content: {}", e))?;

        let page_url = Url::parse(url).map_err(|e| anyhow!("Invalid page URL {}: {}", url, e))?;

        let styled = inject_css(&markup, &css);
        let document = kuchiki::parse_html().one(styled);

        let replacements = self.fetch_images(&markup, &page_url).await;
        apply_image_replacements(&document, &replacements);

        let out_path = self.config.out_dir.join(derive_filename(url));
        let html = serialize_document(&document)?;

        fs::write(&out_path, html)
            .await
            .map_err(|e| anyhow!("Failed to write {}: {}", out_path.display(), e))?;

        Ok(out_path)
    }

    /// Fetch every image referenced by the markup, mapping each
    /// original `src` value to a data URI. A failed fetch leaves its
    /// image out of the map so the original reference survives.
    async fn fetch_images(&self, markup: &str, page_url: &Url) -> BTreeMap<String, String> {
        let mut replacements = BTreeMap::new();

        for image in extract_image_refs(markup, page_url) {
            if replacements.contains_key(&image.original) {
                continue;
            }
            match self.fetcher.fetch(&image.resolved).await {
                Ok(resource) => {
                    replacements.insert(image.original, resource.to_data_uri());
                }
                Err(e) => {
                    error!("Failed to inline image {}: {}", image.resolved, e);
                }
            }
        }

        replacements
    }
}

/// Poll the page until the DOM is loaded and stops growing, bounded by
/// a hard cap. Falls back to a fixed delay when the poll script cannot
/// run at all.
async fn wait_for_settle(page: &Page) {
    let deadline = tokio::time::Instant::now() + SETTLE_MAX_WAIT;
    let mut last_count: i64 = -1;

    while tokio::time::Instant::now() < deadline {
        let count = match page
            .evaluate(
                "document.readyState === 'complete' ? document.getElementsByTagName('*').length : -1",
            )
            .await
        {
            Ok(result) => result.into_value::<i64>().unwrap_or(-1),
            Err(e) => {
                debug!("Readiness poll failed, using fixed delay: {}", e);
                tokio::time::sleep(SETTLE_FALLBACK_DELAY).await;
                return;
            }
        };

        if count >= 0 && count == last_count {
            return;
        }

        last_count = count;
        tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
    }

    debug!("Page did not settle within {:?}", SETTLE_MAX_WAIT);
}

/// Build the DOM query returning the resolved link target of every
/// element matching `selector`. The selector is JSON-quoted so user
/// input cannot break out of the script.
fn link_query_script(selector: &str) -> Result<String> {
    let quoted = serde_json::to_string(selector)
        .map_err(|e| anyhow!("Failed to encode selector: {}", e))?;

    Ok(format!(
        r#"
        (() => {{
            const out = [];
            for (const el of document.querySelectorAll({quoted})) {{
                const target = el.href || el.src || '';
                if (target) {{
                    out.push(target);
                }}
            }}
            return out;
        }})()
        "#
    ))
}

/// Drop empty and `mailto:` entries; set semantics deduplicate the rest.
fn filter_links<I>(hrefs: I) -> LinkSet
where
    I: IntoIterator<Item = String>,
{
    hrefs
        .into_iter()
        .filter(|href| !href.is_empty() && !href.starts_with("mailto:"))
        .collect()
}

/// Insert the captured CSS as a `<style>` block at the start of the
/// head, or synthesize a minimal wrapper document when the markup has
/// no head tag.
fn inject_css(markup: &str, css: &str) -> String {
    let style_block = format!("<style>{css}</style>");

    match head_insertion_point(markup) {
        Some(at) => {
            let mut out = String::with_capacity(markup.len() + style_block.len());
            out.push_str(&markup[..at]);
            out.push_str(&style_block);
            out.push_str(&markup[at..]);
            out
        }
        None => format!("<html><head>{style_block}</head>{markup}</html>"),
    }
}

/// Byte offset just past the opening `<head>` tag, if one exists.
fn head_insertion_point(markup: &str) -> Option<usize> {
    let lower = markup.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut from = 0;

    while let Some(pos) = lower[from..].find("<head") {
        let start = from + pos;
        match bytes.get(start + 5).copied() {
            Some(b'>') => return Some(start + 6),
            Some(c) if c.is_ascii_whitespace() => {
                return lower[start..].find('>').map(|end| start + end + 1);
            }
            // Not a head tag (e.g. <header>), keep scanning.
            _ => from = start + 5,
        }
    }

    None
}

/// Pull `(original src, resolved URL)` pairs out of the page markup.
/// References resolve against the page's own URL, not the seed.
fn extract_image_refs(markup: &str, page_url: &Url) -> Vec<ImageReference> {
    let document = Html::parse_document(markup);
    let selector = Selector::parse("img[src]").unwrap();
    let mut refs = Vec::new();

    for element in document.select(&selector) {
        if let Some(src) = element.value().attr("src") {
            if src.is_empty() || src.starts_with("data:") {
                continue;
            }
            match page_url.join(src) {
                Ok(resolved) => refs.push(ImageReference {
                    original: src.to_string(),
                    resolved,
                }),
                Err(e) => warn!("Skipping unresolvable image src \"{}\": {}", src, e),
            }
        }
    }

    refs
}

/// Rewrite every image whose `src` has a replacement. Nodes are
/// collected before mutation so the selection iterator stays valid.
fn apply_image_replacements(document: &NodeRef, replacements: &BTreeMap<String, String>) {
    if replacements.is_empty() {
        return;
    }

    let matches: Vec<_> = match document.select("img[src]") {
        Ok(selection) => selection.collect(),
        Err(()) => return,
    };

    for node_ref in matches {
        let mut attrs = node_ref.attributes.borrow_mut();
        let src = match attrs.get("src") {
            Some(src) => src.to_string(),
            None => continue,
        };
        if let Some(data_uri) = replacements.get(&src) {
            attrs.insert("src", data_uri.clone());
        }
    }
}

fn serialize_document(document: &NodeRef) -> Result<String> {
    let mut output = Vec::new();
    document
        .serialize(&mut output)
        .map_err(|e| anyhow!("Failed to serialize document: {}", e))?;
    String::from_utf8(output).map_err(|e| anyhow!("Serialized document is not UTF-8: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchedResource;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn links(entries: &[&str]) -> LinkSet {
        filter_links(entries.iter().map(|s| s.to_string()))
    }

    #[test]
    fn filter_drops_mailto_and_empty_entries() {
        let set = links(&[
            "https://example.org/docs/a",
            "mailto:someone@example.org",
            "",
            "https://example.org/docs/b",
        ]);
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec!["https://example.org/docs/a", "https://example.org/docs/b"]
        );
    }

    #[test]
    fn filter_deduplicates() {
        let set = links(&["https://example.org/a", "https://example.org/a"]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn css_lands_first_in_head() {
        let markup = "<html><head><title>t</title></head><body></body></html>";
        let styled = inject_css(markup, "body { color: red }");
        assert!(styled
            .contains("<head><style>body { color: red }</style><title>t</title>"));
    }

    #[test]
    fn head_with_attributes_is_recognized() {
        let markup = r#"<html><head lang="en"><title>t</title></head></html>"#;
        let styled = inject_css(markup, ".x{}");
        assert!(styled.contains(r#"<head lang="en"><style>.x{}</style><title>t</title>"#));
    }

    #[test]
    fn header_tag_is_not_mistaken_for_head() {
        let markup = "<header>hi</header>";
        let styled = inject_css(markup, ".x{}");
        assert!(styled.starts_with("<html><head><style>.x{}</style></head>"));
        assert!(styled.contains("<header>hi</header>"));
    }

    #[test]
    fn headless_markup_gets_wrapped() {
        let styled = inject_css("<p>content</p>", ".x{}");
        assert_eq!(
            styled,
            "<html><head><style>.x{}</style></head><p>content</p></html>"
        );
    }

    #[test]
    fn image_refs_resolve_against_page_url() {
        let page_url = Url::parse("https://example.org/docs/page").unwrap();
        let markup = r#"<html><body>
            <img src="pics/a.png">
            <img src="/static/b.png">
            <img src="https://cdn.example.net/c.png">
        </body></html>"#;

        let refs = extract_image_refs(markup, &page_url);
        let resolved: Vec<_> = refs.iter().map(|r| r.resolved.as_str()).collect();

        assert_eq!(
            resolved,
            vec![
                "https://example.org/docs/pics/a.png",
                "https://example.org/static/b.png",
                "https://cdn.example.net/c.png",
            ]
        );
    }

    #[test]
    fn data_uri_images_are_not_refetched() {
        let page_url = Url::parse("https://example.org/").unwrap();
        let markup = r#"<img src="data:image/gif;base64,R0lGOD">"#;
        assert!(extract_image_refs(markup, &page_url).is_empty());
    }

    #[test]
    fn inlined_image_round_trips_original_bytes() {
        let bytes = vec![0x89, 0x50, 0x4e, 0x47];
        let resource = FetchedResource {
            content_type: "image/png".to_string(),
            bytes: bytes.clone(),
        };

        let document =
            kuchiki::parse_html().one(r#"<html><body><img src="pics/a.png"></body></html>"#);
        let mut replacements = BTreeMap::new();
        replacements.insert("pics/a.png".to_string(), resource.to_data_uri());

        apply_image_replacements(&document, &replacements);

        let img = document.select_first("img").unwrap();
        let attrs = img.attributes.borrow();
        let src = attrs.get("src").unwrap();

        assert!(src.starts_with("data:image/png;base64,"));
        let payload = src.rsplit(',').next().unwrap();
        assert_eq!(STANDARD.decode(payload).unwrap(), bytes);
    }

    #[test]
    fn images_without_replacement_keep_their_src() {
        let document = kuchiki::parse_html()
            .one(r#"<html><body><img src="ok.png"><img src="broken.png"></body></html>"#);
        let mut replacements = BTreeMap::new();
        replacements.insert("ok.png".to_string(), "data:image/png;base64,AQID".to_string());

        apply_image_replacements(&document, &replacements);

        let html = serialize_document(&document).unwrap();
        assert!(html.contains("data:image/png;base64,AQID"));
        assert!(html.contains(r#"src="broken.png""#));
    }

    #[test]
    fn archiving_pipeline_is_idempotent() {
        let markup = r#"<html><head></head><body><img src="a.png"></body></html>"#;
        let css = "body { margin: 0 }";
        let mut replacements = BTreeMap::new();
        replacements.insert("a.png".to_string(), "data:image/png;base64,AQID".to_string());

        let render = || {
            let document = kuchiki::parse_html().one(inject_css(markup, css));
            apply_image_replacements(&document, &replacements);
            serialize_document(&document).unwrap()
        };

        assert_eq!(render(), render());
    }

    #[tokio::test]
    async fn written_archive_is_byte_identical_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(derive_filename("https://example.org/docs/a"));

        let render = || {
            let document = kuchiki::parse_html()
                .one(inject_css("<html><head></head><body>hi</body></html>", ".x{}"));
            serialize_document(&document).unwrap()
        };

        tokio::fs::write(&path, render()).await.unwrap();
        let first = tokio::fs::read(&path).await.unwrap();
        tokio::fs::write(&path, render()).await.unwrap();
        let second = tokio::fs::read(&path).await.unwrap();

        assert_eq!(path.file_name().unwrap(), "a.html");
        assert_eq!(first, second);
    }

    #[test]
    fn link_query_script_quotes_the_selector() {
        let script = link_query_script(r#"a[href^="/docs"]"#).unwrap();
        assert!(script.contains(r#"querySelectorAll("a[href^=\"/docs\"]")"#));
    }
}
