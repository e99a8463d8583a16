#![forbid(unsafe_code)]

//! archive.org uploader: existence checks against the metadata endpoint and
//! file uploads through the S3-compatible API, including the sidecar cleanup
//! the archive expects (no empty description/annotations files, no partial
//! downloads).

use anyhow::{Context, Result, bail};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archiver::Reporter;
use crate::config::S3Credentials;
use crate::metadata::{ArchiveMetadata, VideoInfo, create_archive_metadata, derive_item_identifier};

const METADATA_ENDPOINT: &str = "https://archive.org/metadata";
const S3_ENDPOINT: &str = "https://s3.us.archive.org";

/// Annotation document yt-dlp writes for videos that have no annotations.
/// Files with exactly this content carry no information and are not worth
/// uploading.
pub const EMPTY_ANNOTATION_FILE: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" ?><document><annotations></annotations></document>";

/// Leftover extensions yt-dlp uses for in-flight downloads. Their presence
/// next to a basename means the download never finished.
const INCOMPLETE_EXTENSIONS: [&str; 3] = [".part", ".ytdl", ".temp"];

/// Characters percent-encoded inside a URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%')
    .add(b'/');

pub struct Uploader {
    credentials: S3Credentials,
    agent: ureq::Agent,
    reporter: Reporter,
}

impl Uploader {
    pub fn new(credentials: S3Credentials, reporter: Reporter) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(600))
            .build();
        Self {
            credentials,
            agent,
            reporter,
        }
    }

    /// Asks the metadata endpoint whether an item already exists. The
    /// endpoint answers `200 {}` for unknown identifiers, so an empty object
    /// means "free to upload".
    pub fn item_exists(&self, identifier: &str) -> Result<bool> {
        let url = format!("{METADATA_ENDPOINT}/{identifier}");
        let response = self
            .agent
            .get(&url)
            .call()
            .with_context(|| format!("checking whether item {} exists", identifier))?;
        let body: serde_json::Value = response
            .into_json()
            .with_context(|| format!("parsing metadata response for {}", identifier))?;
        Ok(body.as_object().is_some_and(|map| !map.is_empty()))
    }

    /// Uploads every file belonging to `basename` under the identifier
    /// derived from its info record, then removes the local copies.
    ///
    /// Returns the identifier and the final metadata map (including any
    /// caller-supplied custom pairs, which win on key collisions).
    pub fn upload(
        &self,
        basename: &str,
        custom_meta: Option<&BTreeMap<String, String>>,
    ) -> Result<(String, BTreeMap<String, String>)> {
        let info_path = format!("{basename}.info.json");
        let file = File::open(&info_path).with_context(|| format!("opening {}", info_path))?;
        let info: VideoInfo =
            serde_json::from_reader(BufReader::new(file)).context("parsing downloaded info JSON")?;

        ensure_download_complete(basename)?;

        let identifier = derive_item_identifier(&info)?;
        let metadata = create_archive_metadata(&info)?;

        remove_empty_description_sidecar(basename, &info)?;
        remove_empty_annotations_sidecar(basename, &info)?;

        let files = collect_files_for_basename(basename)?;
        if files.is_empty() {
            bail!("no files found for basename {}", basename);
        }

        let merged = merged_metadata(&metadata, custom_meta);
        let headers = metadata_headers(&merged);

        for (index, path) in files.iter().enumerate() {
            // Metadata travels with the bucket-creating first request only.
            let bucket_headers = if index == 0 { Some(&headers) } else { None };
            self.put_file(&identifier, path, bucket_headers)
                .with_context(|| format!("uploading {}", path.display()))?;

            if let Err(err) = fs::remove_file(path) {
                self.reporter.warn(format!(
                    "could not remove {} after upload: {}",
                    path.display(),
                    err
                ));
            }
        }

        Ok((identifier, merged))
    }

    fn put_file(
        &self,
        identifier: &str,
        path: &Path,
        bucket_headers: Option<&Vec<(String, String)>>,
    ) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("non-UTF-8 file name under {}", path.display()))?;
        let encoded_name = utf8_percent_encode(file_name, PATH_SEGMENT).to_string();
        let url = format!("{S3_ENDPOINT}/{identifier}/{encoded_name}");

        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let size = file
            .metadata()
            .with_context(|| format!("reading size of {}", path.display()))?
            .len();

        let mut request = self
            .agent
            .put(&url)
            .set(
                "authorization",
                &format!("LOW {}:{}", self.credentials.access, self.credentials.secret),
            )
            .set("content-type", mime.essence_str())
            .set("x-archive-size-hint", &size.to_string());

        if let Some(headers) = bucket_headers {
            request = request.set("x-archive-auto-make-bucket", "1");
            for (name, value) in headers {
                request = request.set(name, value);
            }
        }

        self.reporter
            .info(format!("Uploading {} to {}", file_name, identifier));
        request.send(BufReader::new(file))?;
        Ok(())
    }
}

/// Refuses to touch a basename whose download never completed; uploading
/// `.part` stubs would publish broken items.
pub fn ensure_download_complete(basename: &str) -> Result<()> {
    for path in collect_files_for_basename(basename)? {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        if INCOMPLETE_EXTENSIONS
            .iter()
            .any(|ext| name.ends_with(ext))
        {
            bail!(
                "video download incomplete ({} found), re-run or delete the stub files",
                name
            );
        }
    }
    Ok(())
}

/// Every file that belongs to the resource: media, `.info.json`,
/// `.description`, thumbnails, subtitles, annotations. All of them share the
/// basename prefix.
pub fn collect_files_for_basename(basename: &str) -> Result<Vec<PathBuf>> {
    let base = Path::new(basename);
    let dir = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let prefix = base
        .file_name()
        .context("basename has no file name component")?
        .to_string_lossy()
        .into_owned();

    let mut files = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("reading download dir {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            files.push(entry.path());
        }
    }

    files.sort();
    Ok(files)
}

pub fn check_is_file_empty(path: &Path) -> Result<bool> {
    let metadata =
        fs::metadata(path).with_context(|| format!("reading metadata of {}", path.display()))?;
    Ok(metadata.len() == 0)
}

/// Deletes the `.description` sidecar when the video has no description, so
/// an empty file is not published alongside the item.
pub fn remove_empty_description_sidecar(basename: &str, info: &VideoInfo) -> Result<()> {
    let path = PathBuf::from(format!("{basename}.description"));
    if !path.exists() {
        return Ok(());
    }
    if info.description.as_deref() == Some("") || check_is_file_empty(&path)? {
        fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
    }
    Ok(())
}

/// Deletes the `.annotations.xml` sidecar when it is empty or contains only
/// the canonical no-annotations document.
pub fn remove_empty_annotations_sidecar(basename: &str, info: &VideoInfo) -> Result<()> {
    let path = PathBuf::from(format!("{basename}.annotations.xml"));
    if !path.exists() {
        return Ok(());
    }
    let field_is_empty = matches!(
        info.annotations.as_deref(),
        Some("") | Some(EMPTY_ANNOTATION_FILE)
    );
    if field_is_empty || check_is_file_empty(&path)? {
        fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
    }
    Ok(())
}

/// Final metadata map for an upload: the converted record plus any custom
/// pairs, which override on collision.
pub fn merged_metadata(
    metadata: &ArchiveMetadata,
    custom_meta: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut merged = metadata.to_map();
    if let Some(custom) = custom_meta {
        for (key, value) in custom {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Renders the metadata map as `x-archive-meta-*` request headers. Pairs
/// with empty values are dropped; the remote treats an absent header and an
/// empty one differently.
pub fn metadata_headers(metadata: &BTreeMap<String, String>) -> Vec<(String, String)> {
    metadata
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (format!("x-archive-meta-{key}"), meta_header_value(value)))
        .collect()
}

/// HTTP header values must be ASCII and single-line; anything else is
/// shipped percent-encoded inside a `uri(...)` wrapper, which the S3
/// endpoint decodes on its side.
pub fn meta_header_value(value: &str) -> String {
    if value.is_ascii() && !value.contains('\n') && !value.contains('\r') {
        value.to_owned()
    } else {
        format!(
            "uri({})",
            utf8_percent_encode(value, percent_encoding::NON_ALPHANUMERIC)
        )
    }
}
