//! Install progress bar and summary reporting for the CLI.

use chrono::Utc;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::storage::EntryInfo;
use crate::worker::{ActivateReport, InstallProgress, InstallReport};
use crate::{format_age, format_bytes};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Progress bar counting pre-fetched resources.
pub struct InstallBar {
    bar: ProgressBar,
}

impl InstallBar {
    #[must_use]
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} resources - {msg}",
            )
            .expect("progress template is valid")
            .progress_chars("━━╌"),
        );
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for InstallBar {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallProgress for InstallBar {
    fn on_install_start(&self, cache_name: &str, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_message(cache_name.to_string());
    }

    fn on_resource_start(&self, url: &str) {
        self.bar.set_message(url.to_string());
    }

    fn on_resource_complete(&self, url: &str, bytes: u64) {
        self.bar.inc(1);
        self.bar
            .println(format!("  {} {url} ({})", style("✓").green(), format_bytes(bytes)));
    }

    fn on_resource_error(&self, url: &str, error: &str) {
        self.bar
            .println(format!("  {} {url}: {error}", style("✗").red()));
    }
}

/// Prints the outcome of an install + activate cycle.
pub fn print_update(install: &InstallReport, activate: &ActivateReport) {
    println!("\n{SEPARATOR}");
    println!("Cache {} installed", style(&install.cache_name).cyan());
    println!("{SEPARATOR}");
    println!("  Resources cached:  {}", install.resources);
    println!("  Total size:        {}", format_bytes(install.bytes));
    for name in &activate.deleted {
        println!("  Deleted cache:     {name}");
    }
    for (name, reason) in &activate.failed {
        println!("  {} {name}: {reason}", style("Could not delete").yellow());
    }
    println!("{SEPARATOR}");
}

/// Prints one cache and its entries.
pub fn print_cache(name: &str, current: bool, entries: &[EntryInfo]) {
    let marker = if current { style("*").green().to_string() } else { " ".to_string() };
    let total: u64 = entries.iter().map(|e| e.size).sum();

    println!("{marker} {name} ({} entries, {})", entries.len(), format_bytes(total));
    let now = Utc::now();
    for entry in entries {
        println!(
            "    {} {:>10}  {:>8}  {}",
            entry.status,
            format_bytes(entry.size),
            format_age(entry.stored_at, now),
            entry.url
        );
    }
}
