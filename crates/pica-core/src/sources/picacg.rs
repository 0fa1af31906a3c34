//! picacg adapter: HMAC-signed JSON API, chaptered page layout.
//!
//! Every request carries an HMAC-SHA256 `signature` over
//! `lower(path + time + nonce + method + api_key)` keyed by a fixed secret,
//! plus the client headers the upstream expects. Episode and page listings
//! are paginated; iteration stops when `pages <= page`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use super::common::{
    count_downloaded, ext_from_url, hex_lower, optional_str, required_str, run_page_jobs, PageJob,
};
use super::{Adapter, AdapterContext, DownloadedComic, SourceKind};
use crate::fetch::{FetchedBody, IMAGE_TIMEOUT, TEXT_TIMEOUT};
use crate::retry::RetryPolicy;

type HmacSha256 = Hmac<Sha256>;

const API_BASE: &str = "https://picaapi.picacomic.com";
const API_KEY: &str = "C69BAF41DA5ABD1FFEDC6D2FEA56B";
const SIGN_SECRET: &str =
    r"~d}$Q7$eIni=V)9\RK/P.RM4;9[7|@/CA}b~OW!3?EV`:<>M7pddUBL5n|0/*Cn";

/// 32-hex request nonce.
fn new_nonce() -> String {
    let raw: [u8; 16] = rand::thread_rng().gen();
    hex_lower(&raw)
}

/// Signature over the relative path and request metadata.
fn sign(path: &str, time: &str, nonce: &str, method: &str) -> String {
    let raw = format!("{path}{time}{nonce}{method}{API_KEY}").to_lowercase();
    let mut mac = HmacSha256::new_from_slice(SIGN_SECRET.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(raw.as_bytes());
    hex_lower(&mac.finalize().into_bytes())
}

fn signed_headers(path: &str, token: &str) -> HashMap<String, String> {
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string();
    let nonce = new_nonce();
    let signature = sign(path, &time, &nonce, "GET");
    HashMap::from([
        ("time".to_string(), time),
        ("nonce".to_string(), nonce),
        ("signature".to_string(), signature),
        ("api-key".to_string(), API_KEY.to_string()),
        ("authorization".to_string(), token.to_string()),
        ("tokenparam".to_string(), token.to_string()),
        ("image-quality".to_string(), "original".to_string()),
        ("app-uuid".to_string(), "defaultUuid".to_string()),
        ("app-channel".to_string(), "2".to_string()),
    ])
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ComicInfoData {
    comic: ComicInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComicInfo {
    title: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    thumb: Option<Media>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Media {
    file_server: String,
    path: String,
}

impl Media {
    fn url(&self) -> String {
        format!(
            "{}/static/{}",
            self.file_server.trim_end_matches('/'),
            self.path
        )
    }
}

#[derive(Debug, Deserialize)]
struct Paginated<T> {
    #[serde(default = "Vec::new")]
    docs: Vec<T>,
    pages: i64,
    page: i64,
}

#[derive(Debug, Deserialize)]
struct EpsData {
    eps: Paginated<Episode>,
}

#[derive(Debug, Deserialize)]
struct Episode {
    order: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct PagesData {
    pages: Paginated<PageDoc>,
}

#[derive(Debug, Deserialize)]
struct PageDoc {
    media: Media,
}

pub struct Picacg;

impl Picacg {
    /// Signed GET of one API path; unwraps the response envelope.
    async fn api_get<T: serde::de::DeserializeOwned>(
        ctx: &AdapterContext<'_>,
        base: &str,
        token: &str,
        path: &str,
        policy: &RetryPolicy,
    ) -> Result<T> {
        let headers = signed_headers(path, token);
        let url = format!("{}/{}", base.trim_end_matches('/'), path);
        let body: FetchedBody = ctx
            .fetcher
            .get_bytes_with_retry(&url, &headers, TEXT_TIMEOUT, None, policy, ctx.stop)
            .await?;
        let envelope: Envelope<T> = body.json()?;
        if let Some(code) = envelope.code {
            if code != 200 {
                bail!(
                    "picacg api error {code}: {}",
                    envelope.message.unwrap_or_default()
                );
            }
        }
        envelope
            .data
            .with_context(|| format!("picacg response for {path} has no data"))
    }
}

#[async_trait]
impl Adapter for Picacg {
    fn kind(&self) -> SourceKind {
        SourceKind::Picacg
    }

    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<DownloadedComic> {
        let token = required_str(ctx.auth, "token")?;
        let base = optional_str(ctx.auth, "apiBaseUrl").unwrap_or(API_BASE);
        let comic_id = ctx.target.trim();
        let policy = RetryPolicy::with_retries(ctx.files.retries);

        let info: ComicInfoData =
            Self::api_get(ctx, base, token, &format!("album/{comic_id}"), &policy).await?;

        // Walk the paginated episode listing to the end.
        let mut eps: Vec<Episode> = Vec::new();
        let mut page = 1i64;
        loop {
            let data: EpsData = Self::api_get(
                ctx,
                base,
                token,
                &format!("album/{comic_id}/eps?page={page}"),
                &policy,
            )
            .await?;
            let batch = data.eps;
            eps.extend(batch.docs);
            if batch.pages <= batch.page {
                break;
            }
            page += 1;
        }
        // The API returns newest-first; display order is the reverse.
        eps.reverse();
        if eps.is_empty() {
            bail!("comic has no episodes");
        }

        let selection = ctx.eps;
        let selected: Vec<(usize, &Episode)> = if selection.is_empty() {
            eps.iter().enumerate().collect()
        } else {
            selection
                .iter()
                .filter_map(|&i| eps.get(i as usize).map(|e| (i as usize, e)))
                .collect()
        };
        if selected.is_empty() {
            bail!("episode selection matches nothing");
        }

        // Enumerate every page URL first so the total is exact.
        let mut chapter_pages: Vec<(usize, Vec<String>)> = Vec::with_capacity(selected.len());
        for (display_index, ep) in &selected {
            let mut urls = Vec::new();
            let mut page = 1i64;
            loop {
                let data: PagesData = Self::api_get(
                    ctx,
                    base,
                    token,
                    &format!("album/{comic_id}/order/{}/pages?page={page}", ep.order),
                    &policy,
                )
                .await?;
                let batch = data.pages;
                urls.extend(batch.docs.iter().map(|d| d.media.url()));
                if batch.pages <= batch.page {
                    break;
                }
                page += 1;
            }
            chapter_pages.push((*display_index, urls));
        }

        let total = 1 + chapter_pages
            .iter()
            .map(|(_, urls)| urls.len() as i64)
            .sum::<i64>();
        ctx.progress.set_total(total).await?;
        ctx.progress
            .ensure_progress_at_least(count_downloaded(ctx.work_dir))
            .await?;

        let mut jobs = Vec::new();
        if let Some(thumb) = &info.comic.thumb {
            jobs.push(PageJob::new(
                thumb.url(),
                ctx.work_dir.join("cover.jpg"),
                HashMap::new(),
            ));
        }
        for (display_index, urls) in &chapter_pages {
            let ep_no = display_index + 1;
            let chapter_dir = ctx.work_dir.join("pages").join(ep_no.to_string());
            for (i, url) in urls.iter().enumerate() {
                let ext = ext_from_url(url);
                jobs.push(PageJob::new(
                    url.clone(),
                    chapter_dir.join(format!("{}.{ext}", i + 1)),
                    HashMap::new(),
                ));
            }
        }
        run_page_jobs(ctx, jobs, IMAGE_TIMEOUT).await?;

        let mut tags = info.comic.categories.clone();
        tags.extend(info.comic.tags.iter().cloned());
        let ep_titles: Vec<&str> = eps.iter().map(|e| e.title.as_str()).collect();
        let downloaded_json = serde_json::json!({
            "title": info.comic.title,
            "author": info.comic.author,
            "eps": ep_titles,
            "selected": selected.iter().map(|(i, _)| i).collect::<Vec<_>>(),
        });
        Ok(DownloadedComic::new(
            comic_id.to_string(),
            info.comic.title.clone(),
            info.comic.author.clone().unwrap_or_default(),
            SourceKind::Picacg,
            tags,
            downloaded_json,
        ))
    }
}
