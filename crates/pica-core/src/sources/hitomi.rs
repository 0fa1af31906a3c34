//! hitomi adapter: gallery js metadata, gg.js-derived image URLs.
//!
//! Image hosts rotate through parameters published in `gg.js`: a set of
//! case-label integers, a path prefix, and an initial value. The file is
//! cached and refreshed at most once per minute. Every page is tried as
//! webp first, then falls back to the file's original extension.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use super::common::{count_downloaded, ext_from_url, page_file_exists, run_page_jobs, PageJob};
use super::{canonical_id, Adapter, AdapterContext, DownloadedComic, SourceKind};
use crate::fanout;
use crate::fetch::{IMAGE_TIMEOUT, TEXT_TIMEOUT};
use crate::retry::{collapse_snippet, RetryPolicy};
use crate::stop::Stopped;

const BASE_DOMAIN: &str = "hitomi.la";

/// How long one gg.js snapshot stays valid.
const GG_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Gg {
    numbers: HashSet<u32>,
    b: String,
    initial: u32,
}

impl Gg {
    fn mm(&self, g: u32) -> u32 {
        if self.numbers.contains(&g) {
            self.initial ^ 1
        } else {
            self.initial
        }
    }
}

/// Parse gg.js: `case N:` labels, the `b: '...'` path prefix, and the
/// `var o = N` initial value.
fn parse_gg(source: &str) -> Result<Gg> {
    let mut numbers = HashSet::new();
    for part in source.split("case ").skip(1) {
        if let Some(label) = part.split(':').next() {
            if let Ok(n) = label.trim().parse::<u32>() {
                numbers.insert(n);
            }
        }
    }
    let initial = source
        .split("var o = ")
        .nth(1)
        .and_then(|rest| rest.split(';').next())
        .and_then(|v| v.trim().parse::<u32>().ok())
        .context("gg.js has no initial value")?;
    let b = source
        .split("b: '")
        .nth(1)
        .and_then(|rest| rest.split('\'').next())
        .map(|b| b.trim_matches('/').to_string())
        .context("gg.js has no path prefix")?;
    Ok(Gg {
        numbers,
        b,
        initial,
    })
}

/// Decimal value of the hash's last char followed by the two chars before
/// it, read as hex.
fn s_value(hash: &str) -> Result<u32> {
    let n = hash.len();
    if n < 3 {
        bail!("image hash too short: {hash}");
    }
    let rearranged = format!("{}{}", &hash[n - 1..], &hash[n - 3..n - 1]);
    u32::from_str_radix(&rearranged, 16)
        .with_context(|| format!("non-hex tail in image hash: {hash}"))
}

/// Full image URL for one hash/extension pair.
fn image_url(gg: &Gg, base_domain: &str, hash: &str, ext: &str) -> Result<String> {
    let g = s_value(hash)?;
    let mm = gg.mm(g);
    let subdomain = if ext == "webp" {
        format!("w{}", mm + 1)
    } else {
        char::from(b'a' + mm as u8).to_string()
    };
    Ok(format!(
        "https://{subdomain}.{base_domain}/{}/{g}/{hash}.{ext}",
        gg.b
    ))
}

fn gg_cache() -> &'static Mutex<HashMap<String, (Instant, Gg)>> {
    static CACHE: OnceLock<Mutex<HashMap<String, (Instant, Gg)>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

#[derive(Debug, Deserialize)]
struct Gallery {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    japanese_title: Option<String>,
    #[serde(default)]
    files: Vec<GalleryFile>,
    #[serde(default)]
    tags: Option<Vec<GalleryTag>>,
}

#[derive(Debug, Deserialize)]
struct GalleryFile {
    name: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct GalleryTag {
    tag: String,
}

/// Cover URL out of the galleryblock snippet; the thumbnail host is
/// protocol-relative in the markup.
fn parse_cover(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let img = Selector::parse("img").expect("static selector");
    let source = Selector::parse("source").expect("static selector");
    let raw = doc
        .select(&img)
        .filter_map(|e| e.value().attr("src").or_else(|| e.value().attr("data-src")))
        .chain(
            doc.select(&source)
                .filter_map(|e| e.value().attr("srcset"))
                .map(|s| s.split_whitespace().next().unwrap_or("")),
        )
        .find(|src| !src.is_empty())?;
    if let Some(rest) = raw.strip_prefix("//") {
        Some(format!("https://{rest}"))
    } else {
        Some(raw.to_string())
    }
}

pub struct Hitomi;

#[async_trait]
impl Adapter for Hitomi {
    fn kind(&self) -> SourceKind {
        SourceKind::Hitomi
    }

    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<DownloadedComic> {
        let id = canonical_id(SourceKind::Hitomi, ctx.target)?;
        let gallery_id = id.trim_start_matches("hitomi");
        let base_domain = ctx
            .auth
            .get("baseDomain")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(BASE_DOMAIN);
        let ltn_base = ctx
            .auth
            .get("ltnBaseUrl")
            .and_then(serde_json::Value::as_str)
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://ltn.{base_domain}"));
        let headers = HashMap::from([(
            "referer".to_string(),
            format!("https://{base_domain}/"),
        )]);
        let policy = RetryPolicy::with_retries(ctx.files.retries);

        // Gallery metadata ships as a JS assignment; strip to the JSON.
        let js = ctx
            .fetcher
            .get_bytes_with_retry(
                &format!("{ltn_base}/galleries/{gallery_id}.js"),
                &headers,
                TEXT_TIMEOUT,
                None,
                &policy,
                ctx.stop,
            )
            .await?
            .text();
        let json_start = js.find('{').context("gallery js has no json object")?;
        let json = &js[json_start..];
        // Typed parse first so a shape mismatch reports a snippet of what
        // the upstream actually sent.
        let gallery: Gallery = serde_json::from_str(json).map_err(|e| {
            anyhow::anyhow!(
                "bad gallery js: {e}: {}",
                collapse_snippet(json.as_bytes())
            )
        })?;
        let raw: serde_json::Value = serde_json::from_str(json).map_err(|e| {
            anyhow::anyhow!(
                "gallery js is not json: {e}: {}",
                collapse_snippet(json.as_bytes())
            )
        })?;
        if gallery.files.is_empty() {
            bail!("gallery has no files");
        }

        let gg = self
            .fetch_gg(ctx, &ltn_base, &headers, &policy)
            .await?;

        let total = gallery.files.len() as i64 + 1;
        ctx.progress.set_total(total).await?;
        ctx.progress
            .ensure_progress_at_least(count_downloaded(ctx.work_dir))
            .await?;

        // Cover from the galleryblock markup.
        let block = ctx
            .fetcher
            .get_bytes_with_retry(
                &format!("{ltn_base}/galleryblock/{gallery_id}.html"),
                &headers,
                TEXT_TIMEOUT,
                None,
                &policy,
                ctx.stop,
            )
            .await?;
        if let Some(cover_url) = parse_cover(&block.text()) {
            run_page_jobs(
                ctx,
                vec![PageJob::new(
                    cover_url,
                    ctx.work_dir.join("cover.jpg"),
                    headers.clone(),
                )],
                IMAGE_TIMEOUT,
            )
            .await?;
        }

        let pages_dir = ctx.work_dir.join("pages");
        tokio::fs::create_dir_all(&pages_dir).await?;
        let jobs: Vec<(usize, &GalleryFile)> = gallery
            .files
            .iter()
            .enumerate()
            .map(|(i, f)| (i + 1, f))
            .collect();
        let gg = &gg;
        let headers = &headers;
        let pages_dir = &pages_dir;
        fanout::for_each_concurrent(jobs, ctx.files.concurrent, ctx.stop, || {}, |(n, file)| {
            async move {
                if page_file_exists(pages_dir, n as u32) {
                    return Ok(());
                }
                let orig_ext = ext_from_url(&file.name);
                let mut candidates = vec![("webp", image_url(gg, base_domain, &file.hash, "webp")?)];
                if orig_ext != "webp" {
                    candidates.push((
                        orig_ext.as_str(),
                        image_url(gg, base_domain, &file.hash, &orig_ext)?,
                    ));
                }
                let mut last_err: Option<anyhow::Error> = None;
                for (ext, url) in &candidates {
                    let dst = pages_dir.join(format!("{n}.{ext}"));
                    match ctx
                        .fetcher
                        .download_to_file(url, &dst, headers, IMAGE_TIMEOUT, None, &policy, ctx.stop)
                        .await
                    {
                        Ok(()) => {
                            ctx.progress.advance(1).await?;
                            return Ok(());
                        }
                        Err(e) if e.downcast_ref::<Stopped>().is_some() => return Err(e),
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(last_err.expect("at least one candidate url"))
            }
        })
        .await?;

        let title = gallery
            .title
            .or(gallery.japanese_title)
            .unwrap_or_else(|| format!("hitomi {gallery_id}"));
        let tags = gallery
            .tags
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.tag)
            .collect();
        Ok(DownloadedComic::new(
            id,
            title,
            String::new(),
            SourceKind::Hitomi,
            tags,
            raw,
        ))
    }
}

impl Hitomi {
    /// gg.js, cached per ltn host and refreshed at most once per minute.
    async fn fetch_gg(
        &self,
        ctx: &AdapterContext<'_>,
        ltn_base: &str,
        headers: &HashMap<String, String>,
        policy: &RetryPolicy,
    ) -> Result<Gg> {
        if let Some((at, gg)) = gg_cache().lock().unwrap().get(ltn_base) {
            if at.elapsed() < GG_TTL {
                return Ok(gg.clone());
            }
        }
        let source = ctx
            .fetcher
            .get_bytes_with_retry(
                &format!("{ltn_base}/gg.js"),
                headers,
                TEXT_TIMEOUT,
                None,
                policy,
                ctx.stop,
            )
            .await?
            .text();
        let gg = parse_gg(&source)?;
        gg_cache()
            .lock()
            .unwrap()
            .insert(ltn_base.to_string(), (Instant::now(), gg.clone()));
        Ok(gg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GG_JS: &str = "var gg = {m: function(g) {var o = 0; switch (g) {\
case 1117:\ncase 2423:\ncase 97:\no = 1; break;\n} return o;}, \
b: '1723648800/', s: function(h) {return h;}};";

    #[test]
    fn parses_gg_parameters() {
        let gg = parse_gg(GG_JS).unwrap();
        assert_eq!(gg.initial, 0);
        assert_eq!(gg.b, "1723648800");
        assert!(gg.numbers.contains(&1117));
        assert!(gg.numbers.contains(&97));
        assert!(!gg.numbers.contains(&5));
        assert_eq!(gg.mm(1117), 1);
        assert_eq!(gg.mm(5), 0);
    }

    #[test]
    fn s_value_reads_rearranged_hex_tail() {
        // last char 'c', then the two before it: "ab" -> 0xcab.
        assert_eq!(s_value("0123abc").unwrap(), 0xcab);
        assert!(s_value("zz").is_err());
        assert!(s_value("xyz").is_err());
    }

    #[test]
    fn image_urls_pick_subdomain_from_mm() {
        let gg = Gg {
            numbers: HashSet::from([0xcab]),
            b: "1723648800".into(),
            initial: 0,
        };
        // In the case set: mm = 1 -> 'b' / w2.
        let url = image_url(&gg, "hitomi.la", "0123abc", "avif").unwrap();
        assert_eq!(url, "https://b.hitomi.la/1723648800/3243/0123abc.avif");
        let url = image_url(&gg, "hitomi.la", "0123abc", "webp").unwrap();
        assert_eq!(url, "https://w2.hitomi.la/1723648800/3243/0123abc.webp");
        // Outside the set: mm = 0 -> 'a' / w1.
        let url = image_url(&gg, "hitomi.la", "0123abd", "webp").unwrap();
        assert!(url.starts_with("https://w1.hitomi.la/"));
    }

    #[test]
    fn cover_extraction_normalizes_protocol_relative() {
        let html = r#"<div class="dj-img1"><img src="//tn.hitomi.la/smalltn/ab/cd/x.jpg"></div>"#;
        assert_eq!(
            parse_cover(html).as_deref(),
            Some("https://tn.hitomi.la/smalltn/ab/cd/x.jpg")
        );
        assert_eq!(parse_cover("<div></div>"), None);
    }
}
