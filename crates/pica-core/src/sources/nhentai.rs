//! nhentai adapter: typed JSON gallery API, flat page layout.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

use super::common::{count_downloaded, optional_str, run_page_jobs, PageJob};
use super::{canonical_id, Adapter, AdapterContext, DownloadedComic, SourceKind};
use crate::fetch::{IMAGE_TIMEOUT, TEXT_TIMEOUT};
use crate::retry::RetryPolicy;

const API_BASE: &str = "https://nhentai.net";
const COVER_BASE: &str = "https://t.nhentai.net";
const IMAGE_BASE: &str = "https://i.nhentai.net";

#[derive(Debug, Deserialize)]
struct Gallery {
    media_id: Option<String>,
    #[serde(default)]
    title: GalleryTitle,
    images: GalleryImages,
    #[serde(default)]
    tags: Vec<GalleryTag>,
}

#[derive(Debug, Default, Deserialize)]
struct GalleryTitle {
    english: Option<String>,
    japanese: Option<String>,
    pretty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GalleryImages {
    cover: Option<ImageSpec>,
    #[serde(default)]
    pages: Vec<ImageSpec>,
}

#[derive(Debug, Deserialize)]
struct ImageSpec {
    /// One-letter image type: j/p/g/w.
    t: String,
}

#[derive(Debug, Deserialize)]
struct GalleryTag {
    #[serde(rename = "type")]
    kind: String,
    name: String,
}

/// Extension for the API's one-letter image type.
fn ext_for_type(t: &str) -> &'static str {
    match t {
        "j" => "jpg",
        "p" => "png",
        "g" => "gif",
        "w" => "webp",
        _ => "jpg",
    }
}

pub struct Nhentai;

#[async_trait]
impl Adapter for Nhentai {
    fn kind(&self) -> SourceKind {
        SourceKind::Nhentai
    }

    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<DownloadedComic> {
        let id = canonical_id(SourceKind::Nhentai, ctx.target)?;
        let gallery_id = id.trim_start_matches("nhentai");

        let api_base = optional_str(ctx.auth, "apiBaseUrl").unwrap_or(API_BASE);
        let cover_base = optional_str(ctx.auth, "coverBaseUrl").unwrap_or(COVER_BASE);
        let image_base = optional_str(ctx.auth, "imageBaseUrl").unwrap_or(IMAGE_BASE);

        let headers = HashMap::new();
        let policy = RetryPolicy::with_retries(ctx.files.retries);
        let body = ctx
            .fetcher
            .get_bytes_with_retry(
                &format!("{api_base}/api/gallery/{gallery_id}"),
                &headers,
                TEXT_TIMEOUT,
                None,
                &policy,
                ctx.stop,
            )
            .await?;
        // Typed parse first: a shape mismatch fails with the same body
        // snippet as a syntax error. The raw value is kept verbatim for
        // the library row.
        let gallery: Gallery = body.json()?;
        let raw: serde_json::Value = body.json()?;
        let Some(media_id) = gallery.media_id.as_deref().filter(|m| !m.is_empty()) else {
            bail!("missing media_id in gallery response");
        };

        let total = gallery.images.pages.len() as i64 + 1;
        ctx.progress.set_total(total).await?;
        ctx.progress
            .ensure_progress_at_least(count_downloaded(ctx.work_dir))
            .await?;

        let mut jobs = Vec::with_capacity(gallery.images.pages.len() + 1);
        let cover_ext = gallery
            .images
            .cover
            .as_ref()
            .map(|c| ext_for_type(&c.t))
            .unwrap_or("jpg");
        jobs.push(PageJob::new(
            format!("{cover_base}/galleries/{media_id}/cover.{cover_ext}"),
            ctx.work_dir.join("cover.jpg"),
            headers.clone(),
        ));
        for (i, page) in gallery.images.pages.iter().enumerate() {
            let n = i + 1;
            let ext = ext_for_type(&page.t);
            jobs.push(PageJob::new(
                format!("{image_base}/galleries/{media_id}/{n}.{ext}"),
                ctx.work_dir.join("pages").join(format!("{n}.{ext}")),
                headers.clone(),
            ));
        }
        run_page_jobs(ctx, jobs, IMAGE_TIMEOUT).await?;

        let title = gallery
            .title
            .pretty
            .or(gallery.title.english)
            .or(gallery.title.japanese)
            .unwrap_or_else(|| format!("nhentai {gallery_id}"));
        let tags = gallery
            .tags
            .iter()
            .map(|t| format!("{}:{}", t.kind, t.name))
            .collect();
        Ok(DownloadedComic::new(
            id,
            title,
            String::new(),
            SourceKind::Nhentai,
            tags,
            raw,
        ))
    }
}
