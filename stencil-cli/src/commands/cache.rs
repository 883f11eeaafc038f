//! `stencil cache` — inspect the committed manifest for a source.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use stencil_core::{config, SourceKey};
use stencil_sync::{manifest, CacheLayout};

/// Arguments for `stencil cache`.
#[derive(Args, Debug)]
pub struct CacheArgs {
    /// Template source the cache belongs to.
    pub path: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct CacheReportJson {
    source: String,
    cache_dir: String,
    synced: bool,
    synced_at: Option<String>,
    generation: Option<String>,
    templates: Vec<TemplateJson>,
}

#[derive(Serialize)]
struct TemplateJson {
    name: String,
    hash: String,
    location: String,
}

#[derive(Tabled)]
struct TemplateRow {
    #[tabled(rename = "template")]
    name: String,
    #[tabled(rename = "hash")]
    hash: String,
    #[tabled(rename = "location")]
    location: String,
}

impl CacheArgs {
    pub fn run(self) -> Result<()> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;
        let config = config::load_at(&home).context("failed to load stencil config")?;

        let key = SourceKey::from_raw(&self.path);
        let layout = CacheLayout::for_source(&config.cache_root_at(&home), &key);
        let manifest = manifest::load(&layout, &key)
            .with_context(|| format!("failed to read cache manifest for '{key}'"))?;
        let synced = manifest.generation.is_some();

        if self.json {
            let payload = CacheReportJson {
                source: key.to_string(),
                cache_dir: layout.root().display().to_string(),
                synced,
                synced_at: synced.then(|| manifest.synced_at.to_rfc3339()),
                generation: manifest.generation.clone(),
                templates: manifest
                    .entries
                    .iter()
                    .map(|(name, entry)| TemplateJson {
                        name: name.clone(),
                        hash: entry.hash.clone(),
                        location: entry.location.clone(),
                    })
                    .collect(),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize cache JSON")?
            );
            return Ok(());
        }

        println!("{} {}", "source:".bold(), key);
        println!("{} {}", "cache:".bold(), layout.root().display());
        if !synced {
            println!("never synced. Run 'stencil sync {}' first.", self.path);
            return Ok(());
        }
        println!(
            "{} {} (generation {})",
            "synced:".bold(),
            manifest.synced_at.format("%Y-%m-%d %H:%M:%S UTC"),
            manifest.generation.as_deref().unwrap_or("-"),
        );

        if manifest.entries.is_empty() {
            println!("No templates cached.");
            return Ok(());
        }

        let rows: Vec<TemplateRow> = manifest
            .entries
            .iter()
            .map(|(name, entry)| TemplateRow {
                name: name.clone(),
                hash: entry.hash.chars().take(12).collect(),
                location: entry.location.clone(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}
