//! Transfer progress display.
//!
//! A thin wrapper over an `indicatif` bar, plus human-readable formatting
//! helpers. The unit here is chunks, not raw bytes, since that is what
//! [`swarmfs_core::DownloadSession::progress`] reports.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Chunk-granularity progress tracker for a single download session.
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Create a new progress tracker over `total_chunks` for `label`
    /// (typically the output file name).
    #[must_use]
    pub fn new(total_chunks: u64, label: &str) -> Self {
        let bar = ProgressBar::new(total_chunks);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} chunks ({bytes}, {eta})")
                .expect("invalid progress bar template")
                .progress_chars("#>-"),
        );
        bar.set_message(format!("Downloading: {label}"));
        Self { bar }
    }

    /// Update to `verified` chunks out of the tracker's total, with
    /// `bytes_downloaded` shown as the byte counter.
    pub fn update(&self, verified: u64, bytes_downloaded: u64) {
        self.bar.set_position(verified);
        self.bar.set_length(self.bar.length().unwrap_or(verified).max(verified));
        self.bar.set_message(format!("{} downloaded", format_bytes(bytes_downloaded)));
    }

    /// Finish with a success message.
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    /// Abandon the bar in place, for error exits.
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

/// Format bytes in human-readable units.
///
/// # Example
///
/// ```
/// use swarmfs_cli::progress::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.00 KB");
/// assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
/// ```
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;
    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }
    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format a duration in human-readable form (`30s`, `1m 30s`, `1h 1m`).
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_crosses_unit_boundaries() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn format_duration_crosses_minute_and_hour_boundaries() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m");
    }

    #[test]
    fn progress_bar_updates_and_finishes_without_panicking() {
        let progress = TransferProgress::new(10, "demo.bin");
        progress.update(5, 5 * 1024 * 1024);
        progress.update(10, 10 * 1024 * 1024);
        progress.finish_with_message("done".to_string());
    }

    #[test]
    fn progress_bar_can_be_abandoned() {
        let progress = TransferProgress::new(4, "demo.bin");
        progress.update(1, 1024);
        progress.abandon();
    }
}
