//! Terminal output for the treesync CLI

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use treesync_config::ServerConfig;
use treesync_network::UpdateOutcome;

/// Spinner shown while a client run is in flight
pub fn create_spinner(quiet: bool, message: &'static str) -> Option<ProgressBar> {
    if quiet {
        return None;
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

/// Summary of what the server publishes
pub fn print_server_banner(config: &ServerConfig) {
    println!(
        "{} Serving on {}",
        style("⟲").blue().bold(),
        style(format!("http://{}", config.listen)).cyan()
    );
    for (name, app) in &config.apps {
        println!(
            "  {} {}",
            style(name).green(),
            style(app.dir.display()).dim()
        );
    }
    if config.watch.enabled {
        println!(
            "  Watching for changes ({} ms debounce)",
            config.watch.minimal_pass_ms
        );
    }
}

/// Result line of a client run
pub fn print_outcome(outcome: &UpdateOutcome) {
    match outcome {
        UpdateOutcome::UpToDate => {
            println!("{} Already up to date", style("✓").green());
        }
        UpdateOutcome::Available { files, bytes } => {
            println!(
                "{} Update available: {} file(s), {}",
                style("ℹ").yellow(),
                style(files).yellow(),
                style(format_bytes(*bytes)).yellow()
            );
        }
        UpdateOutcome::Updated { files } => {
            println!(
                "{} Updated {} file(s)",
                style("✓").green(),
                style(files).green()
            );
        }
    }
}

/// Human readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, "0.00 B")]
    #[case(1023, "1023.00 B")]
    #[case(1536, "1.50 KB")]
    #[case(5 * 1024 * 1024, "5.00 MB")]
    fn test_format_bytes(#[case] bytes: u64, #[case] expected: &str) {
        assert_eq!(format_bytes(bytes), expected);
    }
}
