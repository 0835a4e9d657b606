//! Progress tracking for archive runs.
//!
//! The publisher feeds [`ArchiveProgressEvent`]s and the sizing total into a
//! [`ProgressTracker`], which turns them into [`ProgressState`] snapshots for
//! a callback. [`cli_progress_callback`] renders those snapshots as a single
//! refreshing line on stderr.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::common::ArchiveProgressEvent;

/// Snapshot handed to progress callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressState {
    /// Upper bound from the size walk; `0` until the walk has finished.
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub total_entries: u64,
    pub processed_entries: u64,
    pub elapsed_time: Duration,
    pub speed_mbps: f32,
    pub progress_percent: f32,
}

impl ProgressState {
    /// Calculate estimated time remaining based on current speed
    pub fn estimated_time_remaining(&self) -> Duration {
        if self.speed_mbps <= 0.0 || self.total_bytes == 0 {
            return Duration::from_secs(0);
        }
        let remaining_bytes = self.total_bytes.saturating_sub(self.processed_bytes);
        let remaining_mb = remaining_bytes as f32 / (1024.0 * 1024.0);
        Duration::from_secs_f32((remaining_mb / self.speed_mbps).max(0.0))
    }
}

/// Progress callback function type
pub type ProgressCallback = dyn Fn(ProgressState) + Send + Sync;

/// Combines the sizing total with archive progress events.
pub struct ProgressTracker {
    total_bytes: u64,
    total_entries: u64,
    last: ArchiveProgressEvent,
    start_time: Instant,
    callback: Option<Box<ProgressCallback>>,
}

impl ProgressTracker {
    pub fn new(callback: Option<Box<ProgressCallback>>) -> Self {
        Self {
            total_bytes: 0,
            total_entries: 0,
            last: ArchiveProgressEvent::default(),
            start_time: Instant::now(),
            callback,
        }
    }

    /// Sets the bar's upper bound once the size walk is done.
    pub fn set_totals(&mut self, bytes: u64, entries: u64) {
        self.total_bytes = bytes;
        self.total_entries = entries;
        self.emit();
    }

    pub fn update(&mut self, event: ArchiveProgressEvent) {
        self.last = event;
        self.emit();
    }

    /// Emits a final snapshot at 100%.
    pub fn force_completion(&mut self) {
        if let Some(ref callback) = self.callback {
            let mut state = self.state();
            state.progress_percent = 100.0;
            state.total_bytes = state.total_bytes.max(state.processed_bytes);
            state.total_entries = state.total_entries.max(state.processed_entries);
            callback(state);
        }
    }

    pub fn state(&self) -> ProgressState {
        let elapsed_time = self.start_time.elapsed();
        let processed_bytes = self.last.processed_bytes;
        let speed_mbps = if elapsed_time.as_secs_f32() > 0.0 {
            (processed_bytes as f32 / (1024.0 * 1024.0)) / elapsed_time.as_secs_f32()
        } else {
            0.0
        };
        let progress_percent = if self.total_bytes > 0 {
            ((processed_bytes as f64 / self.total_bytes as f64) * 100.0).min(100.0) as f32
        } else {
            0.0
        };
        ProgressState {
            total_bytes: self.total_bytes,
            processed_bytes,
            total_entries: self.total_entries,
            processed_entries: self.last.entries_processed,
            elapsed_time,
            speed_mbps,
            progress_percent,
        }
    }

    fn emit(&self) {
        if let Some(ref callback) = self.callback {
            callback(self.state());
        }
    }
}

/// Human readable size with 1024-based units, e.g. `1.5 MB`.
pub fn bytes_to_size(bytes: u64) -> String {
    const SIZES: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 Byte".to_string();
    }
    let mut i = 0;
    let mut scaled = bytes as f64;
    while scaled >= 1024.0 && i < SIZES.len() - 1 {
        scaled /= 1024.0;
        i += 1;
    }
    format!("{:.1} {}", scaled, SIZES[i])
}

/// Renders progress as one refreshing stderr line sized to the terminal.
pub fn cli_progress_callback(operation: &str) -> impl Fn(ProgressState) + Send + Sync + 'static {
    let operation = operation.to_uppercase();
    let last_update = Mutex::new(None::<Instant>);
    let prev_len = Mutex::new(0usize);
    let done = AtomicBool::new(false);

    move |state: ProgressState| {
        if done.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        // Update every 100ms to avoid terminal spam, but always show 100% completion
        let should_update = state.progress_percent >= 100.0 || {
            let mut last = last_update.lock().unwrap_or_else(|e| e.into_inner());
            match *last {
                Some(t) if now.duration_since(t) < Duration::from_millis(100) => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };
        if !should_update {
            return;
        }

        let term_width = term_size::dimensions().map(|(w, _)| w).unwrap_or(80);
        let eta = if state.total_bytes == 0 {
            "--".to_string()
        } else {
            let secs = state.estimated_time_remaining().as_secs_f32();
            if secs > 60.0 {
                format!("{:.1}m", secs / 60.0)
            } else {
                format!("{:.1}s", secs)
            }
        };

        let mut bar_width: usize = 40;
        let line = loop {
            let filled = ((state.progress_percent / 100.0) * bar_width as f32) as usize;
            let empty = bar_width - filled.min(bar_width);
            let line = format!(
                "[{}] [{}{}] {:.1}% | {}/{} | {}/{} entries | {:.1} MB/s | ETA: {}",
                operation,
                "█".repeat(filled.min(bar_width)),
                "░".repeat(empty),
                state.progress_percent,
                bytes_to_size(state.processed_bytes),
                bytes_to_size(state.total_bytes),
                state.processed_entries,
                state.total_entries,
                state.speed_mbps,
                eta,
            );
            if line.chars().count() <= term_width || bar_width <= 10 {
                break line;
            }
            bar_width = bar_width.saturating_sub(4).max(10);
        };

        let mut padded = line;
        {
            let mut prev = prev_len.lock().unwrap_or_else(|e| e.into_inner());
            let len = padded.chars().count();
            if *prev > len {
                padded.push_str(&" ".repeat(*prev - len));
            }
            *prev = len;
        }
        eprint!("\r\x1B[2K{}", padded);
        io::stderr().flush().ok();

        if state.progress_percent >= 100.0 {
            eprintln!();
            done.store(true, Ordering::Relaxed);
        }
    }
}
