use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Observer for batch progress.
///
/// `completed` only ever increases. Progress is purely informational and has
/// no effect on scheduling or on the results.
pub trait ProgressSink: Send + Sync {
    fn start(&self, _total: usize) {}

    fn advance(&self, completed: usize, total: usize);

    fn finish(&self) {}
}

impl<F> ProgressSink for F
where
    F: Fn(usize, usize) + Send + Sync,
{
    fn advance(&self, completed: usize, total: usize) {
        self(completed, total)
    }
}

/// Discards all progress updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn advance(&self, _completed: usize, _total: usize) {}
}

/// Progress bar drawn on stderr.
#[derive(Clone)]
pub struct IndicatifProgress {
    bar: ProgressBar,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    /// A bar that never draws, for non-interactive runs.
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), target);
        let style = ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for IndicatifProgress {
    fn start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
    }

    fn advance(&self, completed: usize, _total: usize) {
        self.bar.set_position(completed as u64);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
