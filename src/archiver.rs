#![forbid(unsafe_code)]

//! Orchestrates one archiving run: resolve URLs into video records, skip
//! what was already archived, download the rest, and upload each resource
//! with its converted metadata.

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};

use crate::config::TubeupPaths;
use crate::downloader::{Downloader, append_download_archive, archive_key, load_download_archive};
use crate::metadata::{VideoInfo, derive_item_identifier};
use crate::uploader::Uploader;

/// Console sink for progress and warnings. Constructed once by the caller
/// and handed to every component, so verbosity is explicit state rather than
/// a process-wide setting.
#[derive(Debug, Clone)]
pub struct Reporter {
    verbose: bool,
}

impl Reporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Progress output, only shown in verbose runs.
    pub fn info(&self, message: impl AsRef<str>) {
        if self.verbose {
            println!("{}", message.as_ref());
        }
    }

    /// Recoverable problems. Always shown; the run continues.
    pub fn warn(&self, message: impl AsRef<str>) {
        eprintln!("Warning: {}", message.as_ref());
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    /// Skip resources recorded in the download-archive file from prior runs.
    pub use_download_archive: bool,
    /// Upload even when an item with the same identifier already exists.
    pub ignore_existing_item: bool,
}

/// Sequences download, conversion, and upload for a batch of URLs.
pub struct Archiver {
    paths: TubeupPaths,
    downloader: Downloader,
    uploader: Uploader,
    options: ArchiveOptions,
    reporter: Reporter,
}

impl Archiver {
    pub fn new(
        paths: TubeupPaths,
        downloader: Downloader,
        uploader: Uploader,
        options: ArchiveOptions,
        reporter: Reporter,
    ) -> Self {
        Self {
            paths,
            downloader,
            uploader,
            options,
            reporter,
        }
    }

    /// Archives every resource reachable from the given URLs and returns one
    /// `(identifier, metadata)` pair per uploaded item.
    ///
    /// A failure while processing one resource is reported and the batch
    /// moves on; only setup problems (an unreadable archive file) abort the
    /// whole run.
    pub fn archive_urls(
        &self,
        urls: &[String],
        custom_meta: Option<&BTreeMap<String, String>>,
    ) -> Result<Vec<(String, BTreeMap<String, String>)>> {
        let archive_path = self.paths.download_archive();
        let mut archive = load_download_archive(&archive_path)?;
        let mut results = Vec::new();

        for url in urls {
            let info = match self.downloader.fetch_video_info(url) {
                Ok(info) => info,
                Err(err) => {
                    self.reporter.warn(format!("failed to resolve {url}: {err:#}"));
                    continue;
                }
            };

            for entry in self.downloader.flatten_video_infos(info) {
                match self.archive_entry(&entry, custom_meta, &mut archive) {
                    Ok(Some(pair)) => results.push(pair),
                    Ok(None) => {}
                    Err(err) => {
                        let url = entry.webpage_url.as_deref().unwrap_or("<unknown url>");
                        self.reporter
                            .warn(format!("failed to archive {url}: {err:#}"));
                    }
                }
            }
        }

        Ok(results)
    }

    /// Handles a single video: skip if already archived locally or remotely,
    /// otherwise download and upload it.
    fn archive_entry(
        &self,
        entry: &VideoInfo,
        custom_meta: Option<&BTreeMap<String, String>>,
        archive: &mut HashSet<String>,
    ) -> Result<Option<(String, BTreeMap<String, String>)>> {
        let key = archive_key(entry);

        if self.options.use_download_archive
            && let Some(key) = &key
            && archive.contains(key)
        {
            self.reporter.info(format!(
                "{} is already in the download archive, skipping",
                key
            ));
            return Ok(None);
        }

        if !self.options.ignore_existing_item {
            let identifier = derive_item_identifier(entry)?;
            if self.uploader.item_exists(&identifier)? {
                self.reporter.info(format!(
                    ":: Item already exists. Not downloading.\nTitle: {}\nVideo URL: {}",
                    entry.title.as_deref().unwrap_or("<unknown>"),
                    entry.webpage_url.as_deref().unwrap_or("<unknown>"),
                ));
                self.record_archived(&key, archive)?;
                return Ok(None);
            }
        }

        let basename = self.downloader.download(entry)?;
        let (identifier, metadata) = self.uploader.upload(&basename, custom_meta)?;
        Ok(Some((identifier, metadata)))
    }

    /// Marks a resource as done in the download-archive file so later runs
    /// skip it without a network round trip. yt-dlp records downloads it
    /// performs itself; this covers resources skipped before download.
    fn record_archived(&self, key: &Option<String>, archive: &mut HashSet<String>) -> Result<()> {
        if !self.options.use_download_archive {
            return Ok(());
        }
        if let Some(key) = key
            && archive.insert(key.clone())
        {
            append_download_archive(&self.paths.download_archive(), key)?;
        }
        Ok(())
    }
}
