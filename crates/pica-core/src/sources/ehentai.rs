//! ehentai adapter: HTML gallery scrape, thumbnail walk, reader pages.
//!
//! All `scraper` work happens in sync helpers so the adapter future stays
//! `Send`; parsed documents never live across an await point.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::collections::HashMap;

use super::common::{
    count_downloaded, ext_from_url, page_file_exists, required_str, run_page_jobs, PageJob,
};
use super::{canonical_id, Adapter, AdapterContext, DownloadedComic, SourceKind};
use crate::fanout;
use crate::fetch::{IMAGE_TIMEOUT, TEXT_TIMEOUT};
use crate::retry::RetryPolicy;

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

#[derive(Debug, Default)]
struct GalleryMeta {
    title: String,
    subtitle: String,
    uploader: String,
    total_pages: usize,
    tags: Vec<String>,
    cover_url: Option<String>,
}

/// Scrape the gallery front page: `#gn` title, `#gj` subtitle, uploader,
/// page count, tag taxonomy, and the cover image.
fn parse_gallery(html: &str) -> Result<GalleryMeta> {
    let doc = Html::parse_document(html);
    let mut meta = GalleryMeta::default();

    meta.title = doc
        .select(&sel("#gn"))
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .context("gallery page has no #gn title")?;
    meta.subtitle = doc
        .select(&sel("#gj"))
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .unwrap_or_default();
    meta.uploader = doc
        .select(&sel("#gdn a"))
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    for td in doc.select(&sel("#gdd td")) {
        let text = td.text().collect::<String>();
        let mut words = text.split_whitespace();
        if let (Some(count), Some("pages")) = (words.next(), words.next()) {
            if let Ok(n) = count.parse::<usize>() {
                meta.total_pages = n;
                break;
            }
        }
    }

    for row in doc.select(&sel("#taglist tr")) {
        let namespace = row
            .select(&sel("td.tc"))
            .next()
            .map(|e| {
                e.text()
                    .collect::<String>()
                    .trim()
                    .trim_end_matches(':')
                    .to_string()
            })
            .unwrap_or_default();
        for a in row.select(&sel("td a")) {
            let value = a.text().collect::<String>().trim().to_string();
            if value.is_empty() {
                continue;
            }
            if namespace.is_empty() {
                meta.tags.push(value);
            } else {
                meta.tags.push(format!("{namespace}:{value}"));
            }
        }
    }

    meta.cover_url = doc
        .select(&sel("#gd1 div"))
        .next()
        .and_then(|e| e.value().attr("style"))
        .and_then(extract_css_url);

    Ok(meta)
}

/// `url(...)` target out of an inline background style.
fn extract_css_url(style: &str) -> Option<String> {
    let start = style.find("url(")? + 4;
    let end = style[start..].find(')')? + start;
    let url = style[start..end].trim_matches(|c| c == '"' || c == '\'');
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

/// Reader-page links from one thumbnail page, in display order.
fn parse_reader_links(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    doc.select(&sel("#gdt a"))
        .filter_map(|a| a.value().attr("href"))
        .map(str::to_string)
        .collect()
}

/// The full-size image source on a reader page.
fn parse_image_src(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    doc.select(&sel("#i3 a img"))
        .next()
        .and_then(|img| img.value().attr("src"))
        .map(str::to_string)
}

pub struct Ehentai;

#[async_trait]
impl Adapter for Ehentai {
    fn kind(&self) -> SourceKind {
        SourceKind::Ehentai
    }

    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<DownloadedComic> {
        let cookie = required_str(ctx.auth, "cookie")?;
        let id = canonical_id(SourceKind::Ehentai, ctx.target)?;
        let gallery_url = ctx.target.trim_end_matches('/');
        let headers = HashMap::from([("cookie".to_string(), cookie.to_string())]);
        let policy = RetryPolicy::with_retries(ctx.files.retries);

        let front = ctx
            .fetcher
            .get_bytes_with_retry(
                &format!("{gallery_url}/"),
                &headers,
                TEXT_TIMEOUT,
                None,
                &policy,
                ctx.stop,
            )
            .await?;
        let front_html = front.text();
        let meta = parse_gallery(&front_html)?;
        if meta.total_pages == 0 {
            bail!("gallery page count not found");
        }

        // Walk the thumbnail pages until every reader link is collected.
        let mut reader_links = parse_reader_links(&front_html);
        if reader_links.is_empty() {
            bail!("gallery has no thumbnails");
        }
        let per_page = reader_links.len();
        let thumb_pages = meta.total_pages.div_ceil(per_page);
        for p in 1..thumb_pages {
            let page = ctx
                .fetcher
                .get_bytes_with_retry(
                    &format!("{gallery_url}/?p={p}"),
                    &headers,
                    TEXT_TIMEOUT,
                    None,
                    &policy,
                    ctx.stop,
                )
                .await?;
            reader_links.extend(parse_reader_links(&page.text()));
        }
        reader_links.truncate(meta.total_pages);

        let total = reader_links.len() as i64 + 1;
        ctx.progress.set_total(total).await?;
        ctx.progress
            .ensure_progress_at_least(count_downloaded(ctx.work_dir))
            .await?;

        if let Some(cover_url) = &meta.cover_url {
            run_page_jobs(
                ctx,
                vec![PageJob::new(
                    cover_url.clone(),
                    ctx.work_dir.join("cover.jpg"),
                    headers.clone(),
                )],
                IMAGE_TIMEOUT,
            )
            .await?;
        }

        let pages_dir = ctx.work_dir.join("pages");
        tokio::fs::create_dir_all(&pages_dir).await?;
        let jobs: Vec<(usize, String)> = reader_links
            .into_iter()
            .enumerate()
            .map(|(i, link)| (i + 1, link))
            .collect();
        let headers = &headers;
        let pages_dir = &pages_dir;
        fanout::for_each_concurrent(jobs, ctx.files.concurrent, ctx.stop, || {}, |(n, link)| {
            async move {
                if page_file_exists(pages_dir, n as u32) {
                    return Ok(());
                }
                let reader = ctx
                    .fetcher
                    .get_bytes_with_retry(&link, headers, TEXT_TIMEOUT, None, &policy, ctx.stop)
                    .await?;
                let src = parse_image_src(&reader.text())
                    .with_context(|| format!("reader page {n} has no image"))?;
                if src.contains("509.gif") {
                    bail!("image limit exceeded");
                }
                let ext = ext_from_url(&src);
                let dst = pages_dir.join(format!("{n}.{ext}"));
                ctx.fetcher
                    .download_to_file(&src, &dst, headers, IMAGE_TIMEOUT, None, &policy, ctx.stop)
                    .await?;
                ctx.progress.advance(1).await?;
                Ok(())
            }
        })
        .await?;

        let downloaded_json = serde_json::json!({
            "galleryUrl": ctx.target,
            "uploader": meta.uploader,
            "pages": meta.total_pages,
        });
        Ok(DownloadedComic::new(
            id,
            meta.title,
            meta.subtitle,
            SourceKind::Ehentai,
            meta.tags,
            downloaded_json,
        ))
    }
}
