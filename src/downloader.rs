#![forbid(unsafe_code)]

//! yt-dlp wrapper: resolves URLs into info records, downloads media plus
//! sidecar files (`.info.json`, `.description`, thumbnail, subtitles,
//! annotations), and derives the local basename that ties those files
//! together.

use anyhow::{Context, Result, bail};
use std::collections::{BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
#[cfg(test)]
use std::sync::{Mutex, MutexGuard};

use crate::archiver::Reporter;
use crate::config::TubeupPaths;
use crate::metadata::{MAX_PLAYLIST_DEPTH, RecordKind, ResourceId, VideoInfo};

#[cfg(test)]
static YT_DLP_STUB: Mutex<Option<PathBuf>> = Mutex::new(None);
#[cfg(test)]
static STUB_USE_LOCK: Mutex<()> = Mutex::new(());

fn yt_dlp_command() -> Command {
    #[cfg(test)]
    {
        if let Some(path) = YT_DLP_STUB.lock().unwrap().clone() {
            return Command::new(path);
        }
    }
    Command::new("yt-dlp")
}

#[cfg(test)]
fn set_ytdlp_stub_path(path: PathBuf) -> YtDlpStubGuard {
    let guard = STUB_USE_LOCK.lock().unwrap();
    {
        let mut lock = YT_DLP_STUB.lock().unwrap();
        *lock = Some(path);
    }
    YtDlpStubGuard { lock: Some(guard) }
}

#[cfg(test)]
struct YtDlpStubGuard {
    lock: Option<MutexGuard<'static, ()>>,
}

#[cfg(test)]
impl Drop for YtDlpStubGuard {
    fn drop(&mut self) {
        *YT_DLP_STUB.lock().unwrap() = None;
        self.lock.take();
    }
}

/// Runs `<name> --version` to fail loudly when yt-dlp is missing instead of
/// erroring halfway through a batch.
pub fn ensure_program_available(name: &str) -> Result<()> {
    let status = Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!("{} is installed but returned a failure status", name),
        Err(err) => bail!("{} is not installed or not in PATH: {}", name, err),
    }
}

/// Options forwarded to yt-dlp for both info extraction and downloads.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub output_template: String,
    pub cookies: Option<PathBuf>,
    pub proxy: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_download_archive: bool,
}

/// Drives the external yt-dlp binary for one archiving run.
pub struct Downloader {
    paths: TubeupPaths,
    options: DownloadOptions,
    reporter: Reporter,
}

impl Downloader {
    pub fn new(paths: TubeupPaths, options: DownloadOptions, reporter: Reporter) -> Self {
        Self {
            paths,
            options,
            reporter,
        }
    }

    /// Resolves one URL into its info record via `--dump-single-json`,
    /// without downloading anything yet.
    pub fn fetch_video_info(&self, url: &str) -> Result<VideoInfo> {
        let mut command = yt_dlp_command();
        command.args(build_info_args(&self.options));
        command.arg(url);

        let output = command
            .output()
            .with_context(|| format!("fetching metadata for {}", url))?;

        if !output.status.success() {
            bail!(
                "metadata command failed for {} (status {})",
                url,
                output.status
            );
        }

        let raw_json =
            String::from_utf8(output.stdout).context("parsing metadata JSON response as UTF-8")?;
        serde_json::from_str(&raw_json).context("deserializing metadata JSON")
    }

    /// Expands a (possibly nested) playlist record into its leaf videos.
    /// Unavailable entries and structures nested beyond the depth guard are
    /// skipped with a warning.
    pub fn flatten_video_infos(&self, info: VideoInfo) -> Vec<VideoInfo> {
        let mut leaves = Vec::new();
        self.collect_leaves(info, 0, &mut leaves);
        leaves
    }

    fn collect_leaves(&self, info: VideoInfo, depth: usize, leaves: &mut Vec<VideoInfo>) {
        match info.kind() {
            RecordKind::Video => leaves.push(info),
            RecordKind::Playlist => {
                if depth >= MAX_PLAYLIST_DEPTH {
                    self.reporter
                        .warn("playlist nesting exceeds the supported depth, skipping subtree");
                    return;
                }
                for entry in info.entries.unwrap_or_default() {
                    match entry {
                        Some(entry) => self.collect_leaves(entry, depth + 1, leaves),
                        None => self.reporter.warn("video is not available, skipping"),
                    }
                }
            }
        }
    }

    /// Downloads one video and its sidecar files, returning the basename the
    /// uploader will collect files under.
    pub fn download(&self, info: &VideoInfo) -> Result<String> {
        let url = info
            .webpage_url
            .as_deref()
            .context("video info has no webpage_url")?;

        let mut command = yt_dlp_command();
        command.args(build_download_args(
            &self.options,
            &self.paths,
            self.reporter.verbose(),
        ));
        command.arg(url);

        let status = command
            .status()
            .with_context(|| format!("downloading {}", url))?;
        if !status.success() {
            bail!("download command failed for {} (status {})", url, status);
        }

        let basename = self.prepare_basename(info)?;
        self.reporter.info(format!("Downloaded {}", basename));
        Ok(basename)
    }

    /// Local basename for one video: the rendered output template with the
    /// extension and any fragment-index suffix (`.fNNN`) removed. All sidecar
    /// files of the video share this prefix.
    pub fn prepare_basename(&self, info: &VideoInfo) -> Result<String> {
        // TODO: apply the same character replacements --restrict-filenames
        // performs when the template uses free-form fields like %(title)s.
        let rendered = render_output_template(&self.options.output_template, info);
        let full = self.paths.downloads().join(rendered);
        let without_ext = full.with_extension("");
        let stem = without_ext
            .to_str()
            .context("download path is not valid UTF-8")?;
        Ok(strip_fragment_suffixes(stem))
    }

    /// Basenames for a record and, recursively, every playlist entry below
    /// it. Entries beyond the depth guard are ignored.
    pub fn basenames_from_info(&self, info: &VideoInfo) -> Result<BTreeSet<String>> {
        let mut basenames = BTreeSet::new();
        self.collect_basenames(info, 0, &mut basenames)?;
        Ok(basenames)
    }

    fn collect_basenames(
        &self,
        info: &VideoInfo,
        depth: usize,
        basenames: &mut BTreeSet<String>,
    ) -> Result<()> {
        match info.kind() {
            RecordKind::Video => {
                basenames.insert(self.prepare_basename(info)?);
            }
            RecordKind::Playlist => {
                if depth >= MAX_PLAYLIST_DEPTH {
                    return Ok(());
                }
                for entry in info.entries.iter().flatten().flatten() {
                    self.collect_basenames(entry, depth + 1, basenames)?;
                }
            }
        }
        Ok(())
    }
}

/// Arguments for the metadata-only invocation.
pub fn build_info_args(options: &DownloadOptions) -> Vec<String> {
    let mut args: Vec<String> = [
        "--dump-single-json",
        "--skip-download",
        "--no-warnings",
        "--no-progress",
    ]
    .map(str::to_owned)
    .into();
    push_network_args(&mut args, options);
    args
}

/// Arguments for the actual download: every sidecar the archive wants, plus
/// conservative resume/overwrite behavior so re-runs are cheap.
pub fn build_download_args(
    options: &DownloadOptions,
    paths: &TubeupPaths,
    verbose: bool,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "--continue",
        "--restrict-filenames",
        "--no-overwrites",
        "--retries",
        "9001",
        "--fragment-retries",
        "9001",
        "--ignore-errors",
        "--fixup",
        "detect_or_warn",
        "--write-info-json",
        "--write-description",
        "--write-thumbnail",
        "--write-annotations",
        "--write-subs",
        "--sub-langs",
        "all",
    ]
    .map(str::to_owned)
    .into();

    args.push("--output".to_owned());
    args.push(
        paths
            .downloads()
            .join(&options.output_template)
            .to_string_lossy()
            .into_owned(),
    );

    if verbose {
        args.push("--verbose".to_owned());
    } else {
        args.push("--quiet".to_owned());
    }

    push_network_args(&mut args, options);

    if options.use_download_archive {
        args.push("--download-archive".to_owned());
        args.push(paths.download_archive().to_string_lossy().into_owned());
    }

    args
}

fn push_network_args(args: &mut Vec<String>, options: &DownloadOptions) {
    if let Some(cookies) = &options.cookies {
        args.push("--cookies".to_owned());
        args.push(cookies.to_string_lossy().into_owned());
    }
    if let Some(proxy) = &options.proxy {
        args.push("--proxy".to_owned());
        args.push(proxy.clone());
    }
    if let Some(username) = &options.username {
        args.push("--username".to_owned());
        args.push(username.clone());
    }
    if let Some(password) = &options.password {
        args.push("--password".to_owned());
        args.push(password.clone());
    }
}

/// Renders yt-dlp's `%(field)s` output template for the fields this tool
/// works with. Unknown or absent fields render as `NA`, matching yt-dlp.
pub fn render_output_template(template: &str, info: &VideoInfo) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("%(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find(")s") {
            Some(end) => {
                out.push_str(&template_field_value(info, &after[..end]));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("%(");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn template_field_value(info: &VideoInfo, field: &str) -> String {
    match field {
        "id" => info.id.as_ref().map(ResourceId::as_string),
        "ext" => info.ext.clone(),
        "title" => info.title.clone(),
        "extractor" => info.extractor_key.as_ref().map(|key| key.to_lowercase()),
        "extractor_key" => info.extractor_key.clone(),
        "uploader" => info.uploader.clone(),
        "upload_date" => info.upload_date.clone(),
        _ => None,
    }
    .unwrap_or_else(|| "NA".to_owned())
}

/// Removes every `.f<digits>` fragment-index run yt-dlp may leave in a
/// filename stem (e.g. `video.f137` from format-split downloads).
pub fn strip_fragment_suffixes(stem: &str) -> String {
    let mut out = String::with_capacity(stem.len());
    let mut rest = stem;
    while let Some(pos) = rest.find(".f") {
        let after = &rest[pos + 2..];
        let digits = after.len() - after.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits > 0 {
            out.push_str(&rest[..pos]);
            rest = &after[digits..];
        } else {
            out.push_str(&rest[..pos + 2]);
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

/// Parses the download-archive file into the set of already-processed
/// resource keys (yt-dlp's `<extractor> <id>` line format).
pub fn load_download_archive(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut entries = HashSet::new();

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            entries.insert(trimmed.to_owned());
        }
    }

    Ok(entries)
}

/// Archive key for a record, mirroring yt-dlp's own line format so the file
/// stays interchangeable with `--download-archive`.
pub fn archive_key(info: &VideoInfo) -> Option<String> {
    let extractor = info.extractor_key.as_deref()?.to_lowercase();
    let id = info.id.as_ref()?.as_string();
    Some(format!("{extractor} {id}"))
}

pub fn append_download_archive(path: &Path, key: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening archive {}", path.display()))?;
    writeln!(file, "{}", key).with_context(|| format!("writing archive entry {}", key))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use std::fs;
    use tempfile::tempdir;

    fn test_downloader(dir: &Path, options: DownloadOptions) -> Downloader {
        let paths = TubeupPaths::create(dir).unwrap();
        Downloader::new(paths, options, Reporter::new(false))
    }

    fn default_options() -> DownloadOptions {
        DownloadOptions {
            output_template: "%(id)s.%(ext)s".to_owned(),
            ..DownloadOptions::default()
        }
    }

    fn sample_info() -> VideoInfo {
        serde_json::from_value(json!({
            "webpage_url": "https://www.youtube.com/watch?v=6iRV8liah8A",
            "title": "Mountain 3",
            "extractor_key": "Youtube",
            "id": "6iRV8liah8A",
            "ext": "mp4"
        }))
        .unwrap()
    }

    #[cfg(unix)]
    fn write_stub_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("yt-dlp-stub.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn download_args_always_request_sidecars() {
        let dir = tempdir().unwrap();
        let paths = TubeupPaths::create(dir.path()).unwrap();
        let args = build_download_args(&default_options(), &paths, false);

        for flag in [
            "--write-info-json",
            "--write-description",
            "--write-thumbnail",
            "--write-annotations",
            "--write-subs",
            "--no-overwrites",
            "--continue",
            "--restrict-filenames",
            "--quiet",
        ] {
            assert!(args.contains(&flag.to_owned()), "missing {flag}");
        }
        assert!(!args.contains(&"--cookies".to_owned()));
        assert!(!args.contains(&"--download-archive".to_owned()));

        let output_index = args.iter().position(|a| a == "--output").unwrap();
        assert!(args[output_index + 1].ends_with("%(id)s.%(ext)s"));
    }

    #[test]
    fn download_args_forward_network_options() {
        let dir = tempdir().unwrap();
        let paths = TubeupPaths::create(dir.path()).unwrap();
        let options = DownloadOptions {
            output_template: "%(id)s.%(ext)s".to_owned(),
            cookies: Some(PathBuf::from("/tmp/cookies.txt")),
            proxy: Some("socks5://127.0.0.1:9050".to_owned()),
            username: Some("user".to_owned()),
            password: Some("pass".to_owned()),
            use_download_archive: true,
        };
        let args = build_download_args(&options, &paths, true);

        for pair in [
            ("--cookies", "/tmp/cookies.txt"),
            ("--proxy", "socks5://127.0.0.1:9050"),
            ("--username", "user"),
            ("--password", "pass"),
        ] {
            let index = args.iter().position(|a| a == pair.0).unwrap();
            assert_eq!(args[index + 1], pair.1);
        }
        let archive_index = args.iter().position(|a| a == "--download-archive").unwrap();
        assert!(args[archive_index + 1].ends_with(".ytdlarchive"));
        assert!(args.contains(&"--verbose".to_owned()));
        assert!(!args.contains(&"--quiet".to_owned()));
    }

    #[test]
    fn info_args_skip_download() {
        let options = DownloadOptions {
            cookies: Some(PathBuf::from("/tmp/cookies.txt")),
            ..default_options()
        };
        let args = build_info_args(&options);
        assert!(args.contains(&"--dump-single-json".to_owned()));
        assert!(args.contains(&"--skip-download".to_owned()));
        assert!(args.contains(&"--cookies".to_owned()));
        // Download-only concerns must not leak into the metadata call.
        assert!(!args.iter().any(|a| a == "--write-info-json"));
    }

    #[test]
    fn renders_output_template_fields() {
        let info = sample_info();
        assert_eq!(
            render_output_template("%(id)s.%(ext)s", &info),
            "6iRV8liah8A.mp4"
        );
        assert_eq!(
            render_output_template("%(extractor)s-%(id)s.%(ext)s", &info),
            "youtube-6iRV8liah8A.mp4"
        );
        assert_eq!(
            render_output_template("%(uploader)s.%(ext)s", &info),
            "NA.mp4"
        );
        // Unterminated directives pass through verbatim.
        assert_eq!(render_output_template("%(id", &info), "%(id");
    }

    #[test]
    fn strips_fragment_suffixes() {
        assert_eq!(strip_fragment_suffixes("video.f137"), "video");
        assert_eq!(strip_fragment_suffixes("video.f137.f140"), "video");
        assert_eq!(strip_fragment_suffixes("video.fake"), "video.fake");
        assert_eq!(strip_fragment_suffixes("video"), "video");
        assert_eq!(strip_fragment_suffixes("a.f1b.f2"), "ab");
    }

    #[test]
    fn prepares_basename_under_downloads_dir() {
        let dir = tempdir().unwrap();
        let downloader = test_downloader(dir.path(), default_options());
        let basename = downloader.prepare_basename(&sample_info()).unwrap();

        let expected = dir
            .path()
            .join("downloads")
            .join("6iRV8liah8A")
            .to_string_lossy()
            .into_owned();
        assert_eq!(basename, expected);
    }

    #[test]
    fn basenames_recurse_through_playlists() {
        let dir = tempdir().unwrap();
        let downloader = test_downloader(dir.path(), default_options());

        let playlist: VideoInfo = serde_json::from_value(json!({
            "_type": "playlist",
            "entries": [
                {"id": "one", "ext": "mp4", "webpage_url": "https://e/1"},
                null,
                {
                    "_type": "playlist",
                    "entries": [{"id": "two", "ext": "webm", "webpage_url": "https://e/2"}]
                },
                {"id": "one", "ext": "mp4", "webpage_url": "https://e/1"}
            ]
        }))
        .unwrap();

        let basenames = downloader.basenames_from_info(&playlist).unwrap();
        // Duplicate entries collapse; the null entry is ignored.
        assert_eq!(basenames.len(), 2);
        assert!(basenames.iter().any(|b| b.ends_with("/one")));
        assert!(basenames.iter().any(|b| b.ends_with("/two")));
    }

    #[test]
    fn flatten_skips_unavailable_and_too_deep_entries() {
        let dir = tempdir().unwrap();
        let downloader = test_downloader(dir.path(), default_options());

        // Build a playlist nested beyond the guard around a single leaf.
        let mut nested = json!({"id": "leaf", "webpage_url": "https://e/leaf"});
        for _ in 0..(MAX_PLAYLIST_DEPTH + 1) {
            nested = json!({"_type": "playlist", "entries": [nested]});
        }
        let too_deep: VideoInfo = serde_json::from_value(nested).unwrap();
        assert!(downloader.flatten_video_infos(too_deep).is_empty());

        let shallow: VideoInfo = serde_json::from_value(json!({
            "_type": "playlist",
            "entries": [null, {"id": "ok", "webpage_url": "https://e/ok"}]
        }))
        .unwrap();
        let leaves = downloader.flatten_video_infos(shallow);
        assert_eq!(leaves.len(), 1);
        assert_eq!(
            leaves[0].id.as_ref().map(ResourceId::as_string).as_deref(),
            Some("ok")
        );
    }

    #[test]
    fn archive_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".ytdlarchive");

        assert!(load_download_archive(&path).unwrap().is_empty());

        let key = archive_key(&sample_info()).unwrap();
        assert_eq!(key, "youtube 6iRV8liah8A");

        append_download_archive(&path, &key).unwrap();
        append_download_archive(&path, "vimeo 123").unwrap();

        let entries = load_download_archive(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains(&key));
        assert!(entries.contains("vimeo 123"));

        assert!(archive_key(&VideoInfo::default()).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn fetch_video_info_parses_stub_output() {
        let dir = tempdir().unwrap();
        let stub = write_stub_script(
            dir.path(),
            r#"cat <<'EOF'
{"webpage_url": "https://www.youtube.com/watch?v=abc", "title": "Stubbed", "extractor_key": "Youtube", "id": "abc"}
EOF"#,
        );
        let _guard = set_ytdlp_stub_path(stub);

        let downloader = test_downloader(dir.path(), default_options());
        let info = downloader
            .fetch_video_info("https://www.youtube.com/watch?v=abc")
            .unwrap();
        assert_eq!(info.title.as_deref(), Some("Stubbed"));
        assert_eq!(info.kind(), RecordKind::Video);
    }

    #[cfg(unix)]
    #[test]
    fn fetch_video_info_fails_on_nonzero_exit() {
        let dir = tempdir().unwrap();
        let stub = write_stub_script(dir.path(), "exit 3");
        let _guard = set_ytdlp_stub_path(stub);

        let downloader = test_downloader(dir.path(), default_options());
        let err = downloader
            .fetch_video_info("https://www.youtube.com/watch?v=abc")
            .unwrap_err();
        assert!(err.to_string().contains("metadata command failed"));
    }

    #[cfg(unix)]
    #[test]
    fn download_returns_basename_on_success() {
        let dir = tempdir().unwrap();
        let stub = write_stub_script(dir.path(), "exit 0");
        let _guard = set_ytdlp_stub_path(stub);

        let downloader = test_downloader(dir.path(), default_options());
        let basename = downloader.download(&sample_info()).unwrap();
        assert!(basename.ends_with("/6iRV8liah8A"));
    }
}
