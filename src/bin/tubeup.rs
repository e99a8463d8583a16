#![forbid(unsafe_code)]

//! Command-line entry point: downloads the given URLs with yt-dlp and
//! mirrors each resource, with converted metadata, to archive.org.

use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use tubeup::archiver::{ArchiveOptions, Archiver, Reporter};
use tubeup::config::{
    RuntimeOverrides, TubeupPaths, default_ia_config_path, parse_ia_config_file,
    resolve_runtime_settings,
};
use tubeup::downloader::{DownloadOptions, Downloader, ensure_program_available};
use tubeup::security::ensure_not_root;
use tubeup::uploader::Uploader;

const USAGE: &str = "Usage: tubeup [options] <url>...
  --dir <path>             data directory (default ~/.tubeup)
  --ia-config <path>       internetarchive configuration file
  --output <template>      yt-dlp output template (default %(id)s.%(ext)s)
  --cookies <file>         cookies file passed to yt-dlp
  --proxy <url>            proxy passed to yt-dlp
  --username <user>        account name passed to yt-dlp
  --password <pass>        account password passed to yt-dlp
  --metadata <key:value>   extra metadata pair, wins over derived values (repeatable)
  --use-download-archive   skip resources already recorded in .ytdlarchive
  --ignore-existing-item   upload without checking archive.org first
  --quiet                  only print warnings and errors";

#[derive(Debug, Clone)]
struct CliArgs {
    urls: Vec<String>,
    data_dir: Option<PathBuf>,
    ia_config: Option<PathBuf>,
    output_template: Option<String>,
    cookies: Option<PathBuf>,
    proxy: Option<String>,
    username: Option<String>,
    password: Option<String>,
    custom_meta: BTreeMap<String, String>,
    use_download_archive: bool,
    ignore_existing_item: bool,
    quiet: bool,
}

impl CliArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut urls = Vec::new();
        let mut data_dir: Option<PathBuf> = None;
        let mut ia_config: Option<PathBuf> = None;
        let mut output_template: Option<String> = None;
        let mut cookies: Option<PathBuf> = None;
        let mut proxy: Option<String> = None;
        let mut username: Option<String> = None;
        let mut password: Option<String> = None;
        let mut custom_meta = BTreeMap::new();
        let mut use_download_archive = false;
        let mut ignore_existing_item = false;
        let mut quiet = false;
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            if arg == "--" {
                urls.extend(args);
                break;
            }

            if let Some((flag, value)) = arg.split_once('=')
                && flag.starts_with("--")
            {
                Self::apply_valued_flag(
                    flag,
                    value.to_string(),
                    &mut data_dir,
                    &mut ia_config,
                    &mut output_template,
                    &mut cookies,
                    &mut proxy,
                    &mut username,
                    &mut password,
                    &mut custom_meta,
                )?;
                continue;
            }

            match arg.as_str() {
                "--use-download-archive" => use_download_archive = true,
                "--ignore-existing-item" => ignore_existing_item = true,
                "--quiet" => quiet = true,
                "--help" | "-h" => bail!("{}", USAGE),
                flag @ ("--dir" | "--ia-config" | "--output" | "--cookies" | "--proxy"
                | "--username" | "--password" | "--metadata") => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))?;
                    Self::apply_valued_flag(
                        flag,
                        value,
                        &mut data_dir,
                        &mut ia_config,
                        &mut output_template,
                        &mut cookies,
                        &mut proxy,
                        &mut username,
                        &mut password,
                        &mut custom_meta,
                    )?;
                }
                _ if arg.starts_with('-') => {
                    bail!("unknown argument: {arg}");
                }
                _ => urls.push(arg),
            }
        }

        if urls.is_empty() {
            bail!("{}", USAGE);
        }

        Ok(Self {
            urls,
            data_dir,
            ia_config,
            output_template,
            cookies,
            proxy,
            username,
            password,
            custom_meta,
            use_download_archive,
            ignore_existing_item,
            quiet,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_valued_flag(
        flag: &str,
        value: String,
        data_dir: &mut Option<PathBuf>,
        ia_config: &mut Option<PathBuf>,
        output_template: &mut Option<String>,
        cookies: &mut Option<PathBuf>,
        proxy: &mut Option<String>,
        username: &mut Option<String>,
        password: &mut Option<String>,
        custom_meta: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        match flag {
            "--dir" => *data_dir = Some(PathBuf::from(value)),
            "--ia-config" => *ia_config = Some(PathBuf::from(value)),
            "--output" => *output_template = Some(value),
            "--cookies" => *cookies = Some(PathBuf::from(value)),
            "--proxy" => *proxy = Some(value),
            "--username" => *username = Some(value),
            "--password" => *password = Some(value),
            "--metadata" => {
                let (key, meta_value) = value
                    .split_once(':')
                    .with_context(|| format!("--metadata expects key:value, got {value}"))?;
                if key.is_empty() {
                    bail!("--metadata expects key:value, got {value}");
                }
                custom_meta.insert(key.to_string(), meta_value.to_string());
            }
            _ => bail!("unknown argument: {flag}"),
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    ensure_not_root("tubeup")?;

    let args = CliArgs::parse()?;

    ensure_program_available("yt-dlp")?;

    let settings = resolve_runtime_settings(RuntimeOverrides {
        data_dir: args.data_dir.clone(),
        ia_config: args.ia_config.clone(),
        output_template: args.output_template.clone(),
        ..RuntimeOverrides::default()
    })?;

    let paths = TubeupPaths::create(&settings.data_dir)?;

    let ia_config_path = settings
        .ia_config
        .or_else(default_ia_config_path)
        .context("no internetarchive configuration file found; run `ia configure` first")?;
    let credentials = parse_ia_config_file(&ia_config_path)?;

    let reporter = Reporter::new(!args.quiet);
    let downloader = Downloader::new(
        paths.clone(),
        DownloadOptions {
            output_template: settings.output_template,
            cookies: args.cookies.clone(),
            proxy: args.proxy.clone(),
            username: args.username.clone(),
            password: args.password.clone(),
            use_download_archive: args.use_download_archive,
        },
        reporter.clone(),
    );
    let uploader = Uploader::new(credentials, reporter.clone());
    let archiver = Archiver::new(
        paths,
        downloader,
        uploader,
        ArchiveOptions {
            use_download_archive: args.use_download_archive,
            ignore_existing_item: args.ignore_existing_item,
        },
        reporter.clone(),
    );

    reporter.info("===================================");
    reporter.info("tubeup - mirror videos to archive.org");
    reporter.info("===================================");

    let custom_meta = if args.custom_meta.is_empty() {
        None
    } else {
        Some(&args.custom_meta)
    };
    let results = archiver.archive_urls(&args.urls, custom_meta)?;

    for (identifier, _metadata) in &results {
        println!(
            ":: Upload finished. Item information located at https://archive.org/details/{identifier}"
        );
    }

    if results.is_empty() {
        bail!("no resources were archived");
    }

    Ok(())
}
