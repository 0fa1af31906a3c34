//! jm adapter: tokened API, AES-decrypted payloads, image descrambling.
//!
//! Every API request carries `token = md5(time + token_key)` and
//! `tokenparam = "time,appVersion"`. Response bodies arrive base64-encoded
//! and AES-128-ECB encrypted under `md5(time + payload_secret)`; the
//! decrypted text is right-trimmed to the last `}` or `]` before JSON
//! parsing. Images are split into N horizontal bands and must be
//! reassembled in reverse order, where N derives from the chapter id, the
//! picture name, and the configured scramble id.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, KeyInit};
use aes::Aes128;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use md5::{Digest, Md5};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

use super::common::{
    count_downloaded, ext_from_url, file_nonempty, hex_lower, optional_str, required_str,
};
use super::{canonical_id, Adapter, AdapterContext, DownloadedComic, SourceKind};
use crate::fanout;
use crate::fetch::{IMAGE_TIMEOUT, TEXT_TIMEOUT};
use crate::retry::{collapse_snippet, RetryPolicy};

type Aes128EcbDec = ecb::Decryptor<Aes128>;

const TOKEN_KEY: &str = "18comicAPPContent";
const PAYLOAD_SECRET: &str = "185Hcomic3PAPP7R";
const DEFAULT_SCRAMBLE_ID: &str = "220980";

/// Chapter ids below this always use 10 segments (legacy scheme).
const LEGACY_SEGMENT_BOUNDARY: u64 = 268_850;
/// Chapter ids above this use the mod-8 segment formula.
const MOD8_BOUNDARY: u64 = 421_926;

fn md5_hex(input: &str) -> String {
    hex_lower(&Md5::digest(input.as_bytes()))
}

fn api_headers(time: &str, app_version: &str) -> HashMap<String, String> {
    HashMap::from([
        ("token".to_string(), md5_hex(&format!("{time}{TOKEN_KEY}"))),
        ("tokenparam".to_string(), format!("{time},{app_version}")),
    ])
}

/// Base64-decode and AES-128-ECB-decrypt an API payload, then right-trim
/// the plaintext to the last `}` or `]`.
fn decrypt_payload(data_b64: &str, time: &str) -> Result<String> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(data_b64.trim())
        .context("base64-decode api payload")?;
    let key = Md5::digest(format!("{time}{PAYLOAD_SECRET}").as_bytes());
    let dec = Aes128EcbDec::new_from_slice(&key)
        .map_err(|e| anyhow::anyhow!("build aes decryptor: {e}"))?;
    let plain = dec
        .decrypt_padded_vec_mut::<Pkcs7>(&raw)
        .map_err(|e| anyhow::anyhow!("aes-decrypt api payload: {e}"))?;
    let text = String::from_utf8_lossy(&plain);
    let cut = text
        .rfind(['}', ']'])
        .map(|i| i + 1)
        .context("decrypted payload has no json terminator")?;
    Ok(text[..cut].to_string())
}

/// Segment count for one scrambled image.
fn segment_count(chapter_id: u64, picture_name: &str, scramble_id: u64) -> u32 {
    if chapter_id < scramble_id {
        return 0;
    }
    if chapter_id < LEGACY_SEGMENT_BOUNDARY {
        return 10;
    }
    let digest = md5_hex(&format!("{chapter_id}{picture_name}"));
    let c = digest.bytes().last().unwrap_or(0) as u32;
    if chapter_id > MOD8_BOUNDARY {
        (c % 8) * 2 + 2
    } else {
        (c % 10) * 2 + 2
    }
}

/// Reassemble a scrambled image: N horizontal bands of height `H / N`
/// (residual rows stay with the last band), stacked in reverse order, then
/// re-encoded as JPEG. `N <= 1` passes the bytes through untouched.
fn descramble(data: &[u8], segments: u32) -> Result<Vec<u8>> {
    if segments <= 1 {
        return Ok(data.to_vec());
    }
    let img = image::load_from_memory(data).context("unreadable image")?;
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    if height < segments {
        bail!("image too short to descramble ({height} rows, {segments} segments)");
    }
    let base = height / segments;
    let rem = height % segments;

    let mut out = image::RgbImage::new(width, height);
    let mut dst_y = 0u32;
    for i in (0..segments).rev() {
        let src_y = i * base;
        let band_h = if i == segments - 1 { base + rem } else { base };
        let band = image::imageops::crop_imm(&rgb, 0, src_y, width, band_h).to_image();
        image::imageops::replace(&mut out, &band, 0, dst_y as i64);
        dst_y += band_h;
    }

    let mut buf = Cursor::new(Vec::new());
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 90)
        .encode_image(&out)
        .context("re-encode descrambled image")?;
    Ok(buf.into_inner())
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    code: Option<i64>,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Album {
    name: String,
    #[serde(default)]
    author: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    series: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    id: serde_json::Value,
    #[serde(default)]
    sort: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Chapter {
    #[serde(default)]
    images: Vec<String>,
}

fn value_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct Jm;

impl Jm {
    /// Tokened GET returning the decrypted payload as a JSON value.
    async fn api_get(
        ctx: &AdapterContext<'_>,
        api_base: &str,
        app_version: &str,
        path: &str,
        policy: &RetryPolicy,
    ) -> Result<serde_json::Value> {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        let headers = api_headers(&time, app_version);
        let url = format!("{}/{}", api_base.trim_end_matches('/'), path);
        let body = ctx
            .fetcher
            .get_bytes_with_retry(&url, &headers, TEXT_TIMEOUT, None, policy, ctx.stop)
            .await?;
        let resp: ApiResponse = body.json()?;
        if let Some(code) = resp.code {
            if code != 200 {
                bail!("jm api error code {code}");
            }
        }
        let payload = match &resp.data {
            serde_json::Value::String(encrypted) => decrypt_payload(encrypted, &time)?,
            other => other.to_string(),
        };
        serde_json::from_str(&payload).map_err(|e| {
            anyhow::anyhow!(
                "decrypted payload is not json: {e}: {}",
                collapse_snippet(payload.as_bytes())
            )
        })
    }

    /// Parse a decrypted payload into its record shape; a mismatch carries
    /// a snippet of the payload so the task message stays actionable.
    fn parse_payload<T: serde::de::DeserializeOwned>(
        what: &str,
        value: &serde_json::Value,
    ) -> Result<T> {
        serde_json::from_value(value.clone()).map_err(|e| {
            anyhow::anyhow!(
                "unexpected {what} shape: {e}: {}",
                collapse_snippet(value.to_string().as_bytes())
            )
        })
    }
}

#[async_trait]
impl Adapter for Jm {
    fn kind(&self) -> SourceKind {
        SourceKind::Jm
    }

    async fn run(&self, ctx: &AdapterContext<'_>) -> Result<DownloadedComic> {
        let api_base = required_str(ctx.auth, "apiBaseUrl")?;
        let img_base = required_str(ctx.auth, "imgBaseUrl")?.trim_end_matches('/');
        let app_version = required_str(ctx.auth, "appVersion")?;
        let scramble_id: u64 = optional_str(ctx.auth, "scrambleId")
            .unwrap_or(DEFAULT_SCRAMBLE_ID)
            .parse()
            .map_err(|_| crate::retry::ArgError("scrambleId is not numeric".into()))?;

        let id = canonical_id(SourceKind::Jm, ctx.target)?;
        let album_id = id.trim_start_matches("jm").to_string();
        let policy = RetryPolicy::with_retries(ctx.files.retries);

        let album_raw =
            Self::api_get(ctx, api_base, app_version, &format!("album?id={album_id}"), &policy)
                .await?;
        let album: Album = Self::parse_payload("album", &album_raw)?;

        // A standalone album has no series; it is its own single chapter.
        let mut chapter_ids: Vec<String> = if album.series.is_empty() {
            vec![album_id.clone()]
        } else {
            let mut series: Vec<&Series> = album.series.iter().collect();
            series.sort_by_key(|s| {
                s.sort
                    .as_ref()
                    .map(value_to_string)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(i64::MAX)
            });
            series.iter().map(|s| value_to_string(&s.id)).collect()
        };
        if !ctx.eps.is_empty() {
            chapter_ids = ctx
                .eps
                .iter()
                .filter_map(|&i| chapter_ids.get(i as usize).cloned())
                .collect();
            if chapter_ids.is_empty() {
                bail!("episode selection matches nothing");
            }
        }

        let mut chapters: Vec<(u64, Vec<String>)> = Vec::with_capacity(chapter_ids.len());
        for cid in &chapter_ids {
            let chapter_raw = Self::api_get(
                ctx,
                api_base,
                app_version,
                &format!("chapter?id={cid}"),
                &policy,
            )
            .await?;
            let chapter: Chapter = Self::parse_payload("chapter", &chapter_raw)?;
            let cid_num: u64 = cid
                .parse()
                .map_err(|_| anyhow::anyhow!("chapter id is not numeric: {cid}"))?;
            chapters.push((cid_num, chapter.images));
        }

        let total = 1 + chapters
            .iter()
            .map(|(_, images)| images.len() as i64)
            .sum::<i64>();
        ctx.progress.set_total(total).await?;
        ctx.progress
            .ensure_progress_at_least(count_downloaded(ctx.work_dir))
            .await?;

        // Cover first, then all chapter images through the fan-out.
        struct ImageJob {
            url: String,
            dst: std::path::PathBuf,
            segments: u32,
        }
        let mut jobs = Vec::new();
        jobs.push(ImageJob {
            url: format!("{img_base}/media/albums/{album_id}_3x4.jpg"),
            dst: ctx.work_dir.join("cover.jpg"),
            segments: 0,
        });
        for (ep_index, (cid_num, images)) in chapters.iter().enumerate() {
            let chapter_dir = ctx
                .work_dir
                .join("pages")
                .join((ep_index + 1).to_string());
            for (i, name) in images.iter().enumerate() {
                let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
                let segments = segment_count(*cid_num, stem, scramble_id);
                let ext = if segments > 1 {
                    "jpg".to_string()
                } else {
                    ext_from_url(name)
                };
                jobs.push(ImageJob {
                    url: format!("{img_base}/media/photos/{cid_num}/{name}"),
                    dst: chapter_dir.join(format!("{}.{ext}", i + 1)),
                    segments,
                });
            }
        }

        let headers = HashMap::new();
        let headers = &headers;
        fanout::for_each_concurrent(jobs, ctx.files.concurrent, ctx.stop, || {}, |job| {
            async move {
                if file_nonempty(&job.dst) {
                    return Ok(());
                }
                let body = ctx
                    .fetcher
                    .get_bytes_with_retry(&job.url, headers, IMAGE_TIMEOUT, None, &policy, ctx.stop)
                    .await?;
                if let Some(ct) = &body.content_type {
                    if !ct.starts_with("image/") {
                        bail!("expected image from {} but got {ct}", job.url);
                    }
                }
                let bytes = tokio::task::spawn_blocking({
                    let data = body.body;
                    let segments = job.segments;
                    move || descramble(&data, segments)
                })
                .await
                .context("descramble task join")??;
                if let Some(parent) = job.dst.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&job.dst, &bytes)
                    .await
                    .with_context(|| format!("write {}", job.dst.display()))?;
                ctx.progress.advance(1).await?;
                Ok(())
            }
        })
        .await?;

        let title = album.name.clone();
        let subtitle = album.author.join(", ");
        Ok(DownloadedComic::new(
            id,
            title,
            subtitle,
            SourceKind::Jm,
            album.tags.clone(),
            album_raw,
        ))
    }
}
