#![forbid(unsafe_code)]

//! Metadata conversion layer for tubeup.
//!
//! Turns the raw info record produced by yt-dlp into the metadata record
//! archive.org expects, and derives the stable item identifier used as the
//! upload target. Everything in this module is pure: no I/O, no mutation of
//! the input record, so converting the same record twice yields the same
//! result (modulo the current-date fallback for records without an upload
//! date).

use std::collections::BTreeMap;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Upper bound on nested playlist-in-playlist structures. Anything deeper is
/// treated as malformed input and ignored rather than recursed into.
pub const MAX_PLAYLIST_DEPTH: usize = 10;

/// archive.org caps the subject field at 255 bytes.
const SUBJECT_BYTE_LIMIT: usize = 255;

/// Known license names reported by extractors, mapped to their canonical
/// Creative Commons URLs.
const LICENSE_URLS: [(&str, &str); 7] = [
    (
        "Creative Commons Attribution license (reuse allowed)",
        "https://creativecommons.org/licenses/by/3.0/",
    ),
    (
        "Attribution-NonCommercial-ShareAlike",
        "https://creativecommons.org/licenses/by-nc-sa/2.0/",
    ),
    (
        "Attribution-NonCommercial",
        "https://creativecommons.org/licenses/by-nc/2.0/",
    ),
    (
        "Attribution-NonCommercial-NoDerivs",
        "https://creativecommons.org/licenses/by-nc-nd/2.0/",
    ),
    ("Attribution", "https://creativecommons.org/licenses/by/2.0/"),
    (
        "Attribution-ShareAlike",
        "https://creativecommons.org/licenses/by-sa/2.0/",
    ),
    (
        "Attribution-NoDerivs",
        "https://creativecommons.org/licenses/by-nd/2.0/",
    ),
];

/// Fatal conversion failures. Anything recoverable (malformed tag lists,
/// unknown license names, overlong subjects) is resolved inside the
/// conversion itself and never surfaces here.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("video info is missing the required `{0}` field")]
    MissingField(&'static str),
}

/// Resource identifiers arrive as JSON strings from most extractors but as
/// bare numbers from a few, so both shapes deserialize.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ResourceId {
    Text(String),
    Number(serde_json::Number),
}

impl ResourceId {
    pub fn as_string(&self) -> String {
        match self {
            ResourceId::Text(text) => text.clone(),
            ResourceId::Number(number) => number.to_string(),
        }
    }
}

/// One yt-dlp info record, either a single video or a playlist of entries.
///
/// Every field is optional at the type level; requiredness is enforced by
/// the conversion functions so a missing field is an explicit error branch
/// instead of a panic. `tags` and `categories` stay raw JSON values because
/// some extractors emit garbage there and a malformed list must not sink the
/// whole record.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct VideoInfo {
    pub webpage_url: Option<String>,
    pub title: Option<String>,
    pub extractor_key: Option<String>,
    pub id: Option<ResourceId>,
    pub uploader: Option<String>,
    pub uploader_url: Option<String>,
    pub channel_url: Option<String>,
    pub creator: Option<String>,
    pub upload_date: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Value>,
    #[serde(default)]
    pub categories: Option<Value>,
    pub license: Option<String>,
    #[serde(rename = "_type")]
    pub record_type: Option<String>,
    /// Playlist children. Unavailable entries arrive as JSON `null`, so each
    /// slot is optional.
    #[serde(default)]
    pub entries: Option<Vec<Option<VideoInfo>>>,
    pub annotations: Option<String>,
    pub ext: Option<String>,
}

/// Tagged view over the `_type` field. yt-dlp omits it entirely for plain
/// videos, so absence means `Video`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Video,
    Playlist,
}

impl VideoInfo {
    pub fn kind(&self) -> RecordKind {
        match self.record_type.as_deref() {
            Some("playlist") => RecordKind::Playlist,
            _ => RecordKind::Video,
        }
    }
}

/// Which archive.org collection an item lands in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Collection {
    #[serde(rename = "opensource_audio")]
    OpensourceAudio,
    #[serde(rename = "opensource_movies")]
    OpensourceMovies,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::OpensourceAudio => "opensource_audio",
            Collection::OpensourceMovies => "opensource_movies",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MediaType {
    #[serde(rename = "audio")]
    Audio,
    #[serde(rename = "movies")]
    Movies,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Movies => "movies",
        }
    }
}

/// Normalized metadata record for one archive.org item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveMetadata {
    pub originalurl: String,
    pub mediatype: MediaType,
    pub creator: String,
    pub collection: Collection,
    pub title: String,
    pub description: String,
    pub date: String,
    pub year: String,
    pub subject: String,
    pub licenseurl: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub scanner: String,
}

impl ArchiveMetadata {
    /// Flattens the record into the key/value pairs the upload endpoint
    /// consumes. `channel` is omitted entirely when absent, never emitted as
    /// an empty string.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("originalurl".to_owned(), self.originalurl.clone());
        map.insert("mediatype".to_owned(), self.mediatype.as_str().to_owned());
        map.insert("creator".to_owned(), self.creator.clone());
        map.insert("collection".to_owned(), self.collection.as_str().to_owned());
        map.insert("title".to_owned(), self.title.clone());
        map.insert("description".to_owned(), self.description.clone());
        map.insert("date".to_owned(), self.date.clone());
        map.insert("year".to_owned(), self.year.clone());
        map.insert("subject".to_owned(), self.subject.clone());
        map.insert("licenseurl".to_owned(), self.licenseurl.clone());
        if let Some(channel) = &self.channel {
            map.insert("channel".to_owned(), channel.clone());
        }
        map.insert("scanner".to_owned(), self.scanner.clone());
        map
    }
}

/// Scanner string set on every item so archive.org can track uploads made by
/// this tool.
pub fn scanner() -> String {
    format!(
        "TubeUp Video Stream Mirroring Application {}",
        env!("CARGO_PKG_VERSION")
    )
}

/// Builds the archive.org metadata record for one video info record.
///
/// Fails only when `webpage_url` or `title` is missing (or, transitively,
/// `extractor_key`, which the subject line needs). Every other oddity in the
/// input resolves to a defined fallback value.
pub fn create_archive_metadata(info: &VideoInfo) -> Result<ArchiveMetadata, MetadataError> {
    let originalurl = info
        .webpage_url
        .clone()
        .ok_or(MetadataError::MissingField("webpage_url"))?;
    let title = info
        .title
        .clone()
        .ok_or(MetadataError::MissingField("title"))?;

    let collection = determine_collection_type(&originalurl);
    let mediatype = match collection {
        Collection::OpensourceAudio => MediaType::Audio,
        Collection::OpensourceMovies => MediaType::Movies,
    };

    let date = determine_upload_date(info);
    let year = date[..4].to_owned();

    // Channel URL is attached only when the extractor actually supplied one.
    let channel = info
        .uploader_url
        .clone()
        .or_else(|| info.channel_url.clone());

    Ok(ArchiveMetadata {
        originalurl,
        mediatype,
        creator: determine_creator(info),
        collection,
        title,
        description: determine_description(info),
        date,
        year,
        subject: determine_subject(info)?,
        licenseurl: determine_licenseurl(info),
        channel,
        scanner: scanner(),
    })
}

/// SoundCloud resources go into the audio collection; everything else is
/// treated as a movie. The host must equal `soundcloud.com` exactly, so
/// subdomains and look-alike hosts stay in the movies collection.
pub fn determine_collection_type(url: &str) -> Collection {
    let host = Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_owned));
    if host.as_deref() == Some("soundcloud.com") {
        Collection::OpensourceAudio
    } else {
        Collection::OpensourceMovies
    }
}

/// Picks the creator with a fixed preference order. Twitch clips carry the
/// clip author in `creator` rather than `uploader`; other services may not
/// report an uploader at all, in which case the tool's own name is used.
pub fn determine_creator(info: &VideoInfo) -> String {
    if info.extractor_key.as_deref() == Some("TwitchClips")
        && let Some(creator) = info.creator.as_deref()
        && !creator.is_empty()
    {
        return creator.to_owned();
    }
    if let Some(uploader) = info.uploader.as_deref()
        && !uploader.is_empty()
    {
        return uploader.to_owned();
    }
    if let Some(uploader_url) = info.uploader_url.as_deref()
        && !uploader_url.is_empty()
    {
        return uploader_url.to_owned();
    }
    "tubeup.py".to_owned()
}

/// Parses the extractor's `YYYYMMDD` upload date into `YYYY-MM-DD`. Records
/// without a parseable date get the current local date at conversion time.
pub fn determine_upload_date(info: &VideoInfo) -> String {
    info.upload_date
        .as_deref()
        .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y%m%d").ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| Local::now().format("%Y-%m-%d").to_string())
}

/// Builds the semicolon-delimited subject line: extractor key, the literal
/// `video`, then categories and tags in source order. Lists that are not
/// actually JSON arrays are skipped; scalar entries are stringified.
///
/// The result is trimmed to the 255-byte field limit by dropping whole
/// trailing segments, never by cutting a tag in half.
pub fn determine_subject(info: &VideoInfo) -> Result<String, MetadataError> {
    let extractor_key = info
        .extractor_key
        .as_deref()
        .ok_or(MetadataError::MissingField("extractor_key"))?;

    let mut subject = format!("{extractor_key};video;");
    append_list_values(&mut subject, info.categories.as_ref());
    append_list_values(&mut subject, info.tags.as_ref());

    Ok(truncate_subject(subject))
}

fn append_list_values(subject: &mut String, list: Option<&Value>) {
    let Some(entries) = list.and_then(Value::as_array) else {
        // Absent or malformed (non-array) lists are skipped entirely.
        return;
    };
    for entry in entries {
        if let Some(text) = scalar_text(entry) {
            subject.push_str(&text);
            subject.push(';');
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn truncate_subject(mut subject: String) -> String {
    while subject.len() > SUBJECT_BYTE_LIMIT {
        let mut segments: Vec<&str> = subject.split(';').collect();
        segments.pop();
        subject = segments.join(";");
    }
    subject
}

/// Normalizes the description for archive.org, which does not render raw
/// newlines: every `\r\n` or `\n` becomes a literal `<br>`. A missing or
/// null description becomes the empty string.
pub fn determine_description(info: &VideoInfo) -> String {
    info.description
        .as_deref()
        .unwrap_or("")
        .replace("\r\n", "<br>")
        .replace('\n', "<br>")
}

/// Maps the extractor's license name onto a Creative Commons URL. Unknown or
/// absent license names yield the empty string rather than an error.
pub fn determine_licenseurl(info: &VideoInfo) -> String {
    let Some(license) = info.license.as_deref() else {
        return String::new();
    };
    if license.is_empty() {
        return String::new();
    }
    LICENSE_URLS
        .iter()
        .find(|(name, _)| *name == license)
        .map(|(_, url)| (*url).to_owned())
        .unwrap_or_default()
}

/// Derives the archive.org item identifier for a resource:
/// `<extractor key, lowercased>-<resource id>`, with every character outside
/// the identifier alphabet (`A-Z a-z 0-9 _ -`) replaced by `_`.
///
/// The same `(site, id)` pair always yields the same identifier; it doubles
/// as the remote existence-check key, so the rule must stay stable across
/// releases.
pub fn derive_item_identifier(info: &VideoInfo) -> Result<String, MetadataError> {
    let site = info
        .extractor_key
        .as_deref()
        .ok_or(MetadataError::MissingField("extractor_key"))?
        .to_lowercase();
    let id = info
        .id
        .as_ref()
        .ok_or(MetadataError::MissingField("id"))?
        .as_string();
    Ok(sanitize_identifier(&format!("{site}-{id}")))
}

fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
