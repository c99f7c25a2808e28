//! The live status line.

use crate::stats::ProgressStats;
use crossbeam::channel::Receiver;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Where the status line is drawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisplayMode {
    /// Redrawn in place on stderr.
    #[default]
    Live,
    Hidden,
}

/// Render the status text for accumulated `stats`.
///
/// `total` is the step's `max_progress`; `percent` selects the percentage
/// form, which needs a known total.
pub fn format_status(stats: &ProgressStats, total: Option<u64>, percent: bool) -> String {
    let mut text = match total {
        Some(total) if percent => {
            let pct = if total == 0 {
                100
            } else {
                (stats.progress.saturating_mul(100) / total).min(100)
            };
            format!("Processed: {pct}%")
        }
        Some(total) => format!("Processed: {} / {}", stats.progress, total),
        None => format!("Processed: {}", stats.progress),
    };
    if stats.warning_count > 0 {
        text.push_str(&format!(" | {} warnings", stats.warning_count));
    }
    if stats.error_count > 0 {
        text.push_str(&format!(" | {} errors", stats.error_count));
    }
    text
}

/// Accumulates per-item stats for one step and keeps the status line current.
#[derive(Debug)]
pub struct StatusLine {
    bar: ProgressBar,
    total: Option<u64>,
    percent: bool,
    stats: ProgressStats,
}

impl StatusLine {
    pub fn new(title: &str, total: Option<u64>, percent: bool, mode: DisplayMode) -> Self {
        let bar = match mode {
            DisplayMode::Live => {
                ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr())
            }
            DisplayMode::Hidden => ProgressBar::hidden(),
        };
        let style = ProgressStyle::with_template("{spinner:.green} {prefix:.bold}: {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        bar.set_prefix(title.to_string());
        if mode == DisplayMode::Live {
            bar.enable_steady_tick(Duration::from_millis(120));
        }

        let line = Self {
            bar,
            total,
            percent,
            stats: ProgressStats::zero(),
        };
        line.redraw();
        line
    }

    pub fn stats(&self) -> ProgressStats {
        self.stats
    }

    pub fn message(&self) -> String {
        format_status(&self.stats, self.total, self.percent)
    }

    pub fn update(&mut self, stats: &ProgressStats) {
        self.stats.absorb(stats);
        self.redraw();
    }

    fn redraw(&self) {
        self.bar.set_message(self.message());
    }

    /// Replace the live line with a static summary and return the totals.
    pub fn finish(self) -> ProgressStats {
        self.bar.finish_with_message(self.message());
        self.stats
    }

    /// Leave the line as it is (used on abort) and return the totals.
    pub fn abandon(self) -> ProgressStats {
        self.bar.abandon();
        self.stats
    }

    /// Move the line onto a status thread that drains `progress` until every
    /// sender is gone. The thread hands the line back when it ends.
    pub fn spawn(mut self, progress: Receiver<ProgressStats>) -> io::Result<JoinHandle<StatusLine>> {
        thread::Builder::new()
            .name("osmosis-status".into())
            .spawn(move || {
                for stats in progress {
                    self.update(&stats);
                }
                self
            })
    }
}
