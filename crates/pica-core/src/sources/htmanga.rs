//! htmanga adapter: two-page HTML scrape against a configured mirror.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::collections::HashMap;

use super::common::{count_downloaded, ext_from_url, optional_str, required_str, run_page_jobs, PageJob};
use super::{canonical_id, Adapter, AdapterContext, DownloadedComic, SourceKind};
use crate::fetch::{IMAGE_TIMEOUT, TEXT_TIMEOUT};
use crate::retry::RetryPolicy;

#[derive(Debug, Default)]
struct IndexMeta {
    title: String,
    tags: Vec<String>,
    cover_url: Option<String>,
}

/// True for URLs the gallery script may legitimately reference as images:
/// they must point at the image store and must not be page assets.
fn acceptable_image_url(url: &str) -> bool {
    if url.ends_with(".js") || url.ends_with(".css") {
        return false;
    }
    url.contains("/data/") || url.contains("wnimg")
}

fn normalize_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        url.to_string()
    }
}

/// Metadata from the photo index page: title heading, tag links, cover.
fn parse_index(html: &str) -> Result<IndexMeta> {
    let doc = Html::parse_document(html);
    let h2 = Selector::parse("h2").expect("static selector");
    let title_sel = Selector::parse("title").expect("static selector");
    let tag_sel = Selector::parse(".tagshow, a.tag").expect("static selector");
    let img = Selector::parse("img").expect("static selector");

    let mut meta = IndexMeta::default();
    meta.title = doc
        .select(&h2)
        .next()
        .or_else(|| doc.select(&title_sel).next())
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .context("index page has no title")?;
    meta.tags = doc
        .select(&tag_sel)
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    meta.cover_url = doc
        .select(&img)
        .filter_map(|e| e.value().attr("src"))
        .map(normalize_url)
        .find(|src| acceptable_image_url(src));
    Ok(meta)
}

/// Image URLs out of the gallery page. The listing is embedded in script
/// text, so this scans quoted tokens rather than the DOM.
fn extract_image_urls(html: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for quote in ['"', '\''] {
        for token in html.split(quote) {
            let token = token.trim();
            if !(token.starts_with("http://")
                || token.starts_with("https://")
                || token.starts_with("//"))
            {
                continue;
            }
            if acceptable_image_url(token) {
                let url = normalize_url(token);
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        }
    }
    urls
}

pub struct Htmanga;

#[async_trait]
impl Adapter for Htmanga {
    fn kind(&self) -> SourceKind {
        SourceKind::Htmanga
    }

    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<DownloadedComic> {
        let base = required_str(ctx.auth, "baseUrl")?.trim_end_matches('/');
        let id = canonical_id(SourceKind::Htmanga, ctx.target)?;
        let aid = id.trim_start_matches("Ht");
        let mut headers = HashMap::new();
        if let Some(cookie) = optional_str(ctx.auth, "cookie") {
            headers.insert("cookie".to_string(), cookie.to_string());
        }
        let policy = RetryPolicy::with_retries(ctx.files.retries);

        let index = ctx
            .fetcher
            .get_bytes_with_retry(
                &format!("{base}/photos-index-page-1-aid-{aid}.html"),
                &headers,
                TEXT_TIMEOUT,
                None,
                &policy,
                ctx.stop,
            )
            .await?;
        let meta = parse_index(&index.text())?;

        let gallery = ctx
            .fetcher
            .get_bytes_with_retry(
                &format!("{base}/photos-gallery-aid-{aid}.html"),
                &headers,
                TEXT_TIMEOUT,
                None,
                &policy,
                ctx.stop,
            )
            .await?;
        let image_urls = extract_image_urls(&gallery.text());
        if image_urls.is_empty() {
            bail!("gallery page lists no images");
        }

        let has_cover = meta.cover_url.is_some();
        let total = image_urls.len() as i64 + if has_cover { 1 } else { 0 };
        ctx.progress.set_total(total).await?;
        ctx.progress
            .ensure_progress_at_least(count_downloaded(ctx.work_dir))
            .await?;

        let mut jobs = Vec::with_capacity(image_urls.len() + 1);
        if let Some(cover_url) = &meta.cover_url {
            jobs.push(PageJob::new(
                cover_url.clone(),
                ctx.work_dir.join("cover.jpg"),
                headers.clone(),
            ));
        }
        for (i, url) in image_urls.iter().enumerate() {
            let ext = ext_from_url(url);
            jobs.push(PageJob::new(
                url.clone(),
                ctx.work_dir.join("pages").join(format!("{}.{ext}", i + 1)),
                headers.clone(),
            ));
        }
        run_page_jobs(ctx, jobs, IMAGE_TIMEOUT).await?;

        let downloaded_json = serde_json::json!({
            "aid": aid,
            "baseUrl": base,
            "pages": image_urls.len(),
        });
        Ok(DownloadedComic::new(
            id,
            meta.title,
            String::new(),
            SourceKind::Htmanga,
            meta.tags,
            downloaded_json,
        ))
    }
}
