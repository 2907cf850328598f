//! CLI command implementations

use crate::output::{format_bytes, status_icon, truncate};
use crate::progress::{follow, DownloadProgress, FollowOutcome};
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, Result};
use chimera_core::{canonical_url, AddOutcome, ChimeraCore};
use chimera_types::{Download, DownloadStatus, Settings};
use console::style;
use std::path::PathBuf;

// ============================================================================
// Download Commands
// ============================================================================

pub async fn add_download(
    core: &ChimeraCore,
    url: &str,
    title: &str,
    remote_id: &str,
    dir: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let events = core.subscribe();
    let progress = DownloadProgress::new(title);

    let outcome = match core.add_download(url, remote_id, title, dir).await {
        Ok(outcome) => outcome,
        Err(e) => {
            progress.finish(FollowOutcome::Aborted);
            if e.is_rate_limited() {
                return Err(anyhow!("The host is rate limiting downloads, try again later"));
            }
            return Err(e.into());
        }
    };

    let url = canonical_url(url);
    match outcome {
        AddOutcome::Started { .. } => {}
        AddOutcome::AlreadyTracked => {
            progress.finish(FollowOutcome::Closed);
            println!(
                "{} Already tracked: {} (see `chimera info`)",
                style("•").dim(),
                style(&url).cyan()
            );
            return Ok(());
        }
        AddOutcome::Aborted => {
            progress.finish(FollowOutcome::Aborted);
            return Ok(());
        }
    }

    follow(core, events, &url, &progress).await?;
    print_final(core, &url, format)
}

pub async fn resume_download(core: &ChimeraCore, url: &str, format: OutputFormat) -> Result<()> {
    let url = canonical_url(url);
    let download = core
        .find_download(&url)
        .ok_or_else(|| anyhow!("Download not found: {}", url))?;

    let events = core.subscribe();
    let progress = DownloadProgress::new(&download.title);
    progress.update(&download);

    if !core.resume_download(&url).await? {
        progress.finish(FollowOutcome::Closed);
        println!(
            "{} Nothing to resume: download is {}",
            style("•").dim(),
            download.status()
        );
        return Ok(());
    }

    follow(core, events, &url, &progress).await?;
    print_final(core, &url, format)
}

fn print_final(core: &ChimeraCore, url: &str, format: OutputFormat) -> Result<()> {
    if let (OutputFormat::Json, Some(download)) = (format, core.find_download(url)) {
        println!("{}", serde_json::to_string_pretty(&download)?);
    }
    Ok(())
}

pub async fn list_downloads(
    core: &ChimeraCore,
    status_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let status_filter = status_filter
        .map(|s| s.parse::<DownloadStatus>().map_err(|e| anyhow!(e)))
        .transpose()?;

    let filtered: Vec<Download> = core
        .downloads()
        .into_iter()
        .filter(|d| status_filter.map_or(true, |status| d.status() == status))
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&filtered)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct DownloadRow {
                title: String,
                host: String,
                size: String,
                progress: String,
                status: String,
            }

            let rows: Vec<DownloadRow> = filtered
                .iter()
                .map(|d| DownloadRow {
                    title: truncate(&d.title, 30),
                    host: d.downloader.to_string(),
                    size: d
                        .content_length
                        .map(format_bytes)
                        .unwrap_or_else(|| "?".to_string()),
                    progress: format!("{:.1}%", d.percentage()),
                    status: d.status().to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if filtered.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for download in &filtered {
                print_download_summary(download, show_all);
            }
            println!();
            println!("{} download(s) total", style(filtered.len()).bold());
        }
    }

    Ok(())
}

fn print_download_summary(download: &Download, detailed: bool) {
    let progress = format!("{:.1}%", download.percentage());

    println!(
        "{} {} {} [{}]",
        status_icon(download.status()),
        style(&download.title).bold(),
        style(&progress).dim(),
        style(download.status()).dim()
    );

    if detailed {
        println!("    URL: {}", download.url);
        if download.original_url != download.url {
            println!("    Source: {}", download.original_url);
        }
        println!("    Host: {}", download.downloader);
        if let Some(path) = &download.path {
            println!("    File: {}", path.display());
        }
        match (download.downloaded_bytes(), download.content_length) {
            (Some(done), Some(total)) => {
                println!("    Size: {} / {}", format_bytes(done), format_bytes(total))
            }
            (None, Some(total)) => println!("    Size: {}", format_bytes(total)),
            _ => {}
        }
        println!();
    }
}

pub async fn show_info(core: &ChimeraCore, url: &str, format: OutputFormat) -> Result<()> {
    let download = core
        .find_download(url)
        .ok_or_else(|| anyhow!("Download not found: {}", url))?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&download)?);
        }
        _ => {
            print_download_summary(&download, true);
        }
    }

    Ok(())
}

pub async fn abort_download(core: &ChimeraCore, url: &str) -> Result<()> {
    if core.find_download(url).is_none() {
        return Err(anyhow!("Download not found: {}", url));
    }
    core.abort_download(url).await?;
    println!("{} Download aborted", style("✓").green().bold());
    Ok(())
}

pub async fn remove_download(core: &ChimeraCore, url: &str, yes: bool) -> Result<()> {
    let download = core
        .find_download(url)
        .ok_or_else(|| anyhow!("Download not found: {}", url))?;

    if !yes {
        use dialoguer::Confirm;

        let mut prompt = format!("Remove '{}'", download.title);
        if let Some(path) = &download.path {
            prompt.push_str(&format!(" and delete {}", path.display()));
        }
        prompt.push('?');

        let confirmed = Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()?;
        if !confirmed {
            return Ok(());
        }
    }

    core.remove_download(url).await?;
    println!("{} Download removed", style("✓").green().bold());
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

const CONFIG_KEYS: &[&str] = &[
    "downloads_path",
    "user_agent",
    "max_redirects",
    "progress_interval_ms",
    "gofile_website_token",
    "pixeldrain_mirror",
    "real_debrid_token",
];

fn config_value(settings: &Settings, key: &str) -> Result<String> {
    let value = match key {
        "downloads_path" => settings.downloads_path.display().to_string(),
        "user_agent" => settings.user_agent.clone(),
        "max_redirects" => settings.max_redirects.to_string(),
        "progress_interval_ms" => settings.progress_interval_ms.to_string(),
        "gofile_website_token" => settings.gofile_website_token.clone(),
        "pixeldrain_mirror" => settings.pixeldrain_mirror.clone(),
        "real_debrid_token" => settings
            .real_debrid_token
            .as_ref()
            .map(|_| "(set)".to_string())
            .unwrap_or_else(|| "(not set)".to_string()),
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    };
    Ok(value)
}

fn set_config_value(settings: &mut Settings, key: &str, value: String) -> Result<()> {
    match key {
        "downloads_path" => settings.downloads_path = PathBuf::from(value),
        "user_agent" => settings.user_agent = value,
        "max_redirects" => settings.max_redirects = value.parse()?,
        "progress_interval_ms" => {
            let interval: u64 = value.parse()?;
            if interval == 0 {
                return Err(anyhow!("progress_interval_ms must be positive"));
            }
            settings.progress_interval_ms = interval;
        }
        "gofile_website_token" => settings.gofile_website_token = value,
        "pixeldrain_mirror" => settings.pixeldrain_mirror = value,
        "real_debrid_token" => {
            settings.real_debrid_token = Some(value).filter(|v| !v.is_empty())
        }
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    }
    Ok(())
}

pub async fn config_action(
    core: &ChimeraCore,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = core.get_settings().await;

            match format {
                OutputFormat::Json => {
                    let mut value = serde_json::to_value(&settings)?;
                    if settings.real_debrid_token.is_some() {
                        value["real_debrid_token"] = serde_json::json!("(set)");
                    }
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                _ => {
                    println!("Chimera Configuration ({}):", core.data_dir().display());
                    println!();
                    for key in CONFIG_KEYS {
                        println!("  {}: {}", key, config_value(&settings, key)?);
                    }
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = core.get_settings().await;
            println!("{}", config_value(&settings, &key)?);
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = core.get_settings().await;
            set_config_value(&mut settings, &key, value)?;
            core.update_settings(settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset) => {
            use dialoguer::Confirm;

            let confirmed = Confirm::new()
                .with_prompt("Reset all settings to defaults?")
                .default(false)
                .interact()?;

            if confirmed {
                core.update_settings(Settings::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}
