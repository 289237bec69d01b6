//! Mirrors a task's visible stack onto an indicatif display.
//!
//! Pull-based: callers decide the refresh cadence (a render loop, a watch
//! thread) and call [`StackReporter::update`] with the task to draw. One bar
//! per visible nesting level; bounded trackers render as progress bars,
//! indeterminate ones as spinners.

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::task::Task;
use crate::tracker::View;

pub struct StackReporter {
    multi: MultiProgress,
    bars: Vec<ProgressBar>,
}

impl StackReporter {
    pub fn new() -> Self {
        Self::with_target(MultiProgress::new())
    }

    /// Attach to an existing `MultiProgress`, e.g. one shared with other
    /// subsystems drawing to the same terminal.
    pub fn with_target(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Vec::new(),
        }
    }

    /// Redraws the display from the task's current stack snapshot.
    pub fn update(&mut self, task: &Task) {
        let views = task.stack();

        while self.bars.len() > views.len() {
            if let Some(bar) = self.bars.pop() {
                bar.finish_and_clear();
            }
        }

        for (depth, view) in views.iter().enumerate() {
            if depth == self.bars.len() {
                self.bars.push(self.multi.add(bar_for(view)));
            }

            let bar = &self.bars[depth];
            if view.total_parts() > 0 {
                bar.set_length(view.total_parts());
                bar.set_position(view.parts_completed());
            }
            bar.set_message(view.status());
        }
    }

    /// Clears the bars and prints the task's final line.
    pub fn finish(&mut self, task: &Task) {
        for bar in self.bars.drain(..) {
            bar.finish_and_clear();
        }

        let outcome = if task.completed() {
            style("done").green()
        } else {
            style("failed").red()
        };
        self.multi.println(format!("{task} {outcome}")).ok();
    }
}

impl Default for StackReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn bar_for(view: &View) -> ProgressBar {
    if view.total_parts() == 0 {
        ProgressBar::new_spinner().with_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.blue} {msg}")
                .expect("invalid progress bar template"),
        )
    } else {
        ProgressBar::new(view.total_parts()).with_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("invalid progress bar template")
                .progress_chars("#>-"),
        )
    }
}
