//! Progress reporting for long-running kernel operations.
//!
//! Progress is advisory: listeners observe it but cannot influence control
//! flow, and no operation can be cancelled mid-step.
//!
//! Listeners compose hierarchically. A [`HierarchicalProgress`] splits its own
//! 0-100 range into weighted subtasks and maps every child report onto the
//! sub-range its parent allocated.
//!
//! # Example
//!
//! ```
//! use mesh_kernel::progress::{HierarchicalProgress, ProgressListener};
//!
//! let mut reports = Vec::new();
//! let mut sink = |percent: u32, _task: Option<&str>| reports.push(percent);
//! {
//!     let mut progress = HierarchicalProgress::new(100, Some(&mut sink));
//!     progress.set_subtask_work(40, Some("first"));
//!     progress.set_progress(50, None);
//!     progress.complete_subtask();
//!     progress.set_subtask_work(-1, Some("rest"));
//!     progress.set_progress(50, None);
//! }
//! assert_eq!(reports, vec![0, 20, 40, 40, 70]);
//! ```

/// A sink for progress reports.
///
/// `percent` is in `0..=100`; `task` names the step currently running when
/// the reporter knows it.
pub trait ProgressListener {
    /// Report the current progress.
    fn set_progress(&mut self, percent: u32, task: Option<&str>);
}

impl<F> ProgressListener for F
where
    F: FnMut(u32, Option<&str>),
{
    fn set_progress(&mut self, percent: u32, task: Option<&str>) {
        self(percent, task)
    }
}

/// A snapshot of one progress report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Percentage in `0..=100`.
    pub percent: u32,
    /// Name of the running task, if any.
    pub task: Option<String>,
}

/// Listener that stores every report, mostly useful in tests and tools.
#[derive(Debug, Default, Clone)]
pub struct ProgressRecorder {
    /// Reports in arrival order.
    pub reports: Vec<Progress>,
}

impl ProgressRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The last reported percentage, if any.
    pub fn last_percent(&self) -> Option<u32> {
        self.reports.last().map(|p| p.percent)
    }

    /// Whether the reported percentages never decrease.
    pub fn is_monotonic(&self) -> bool {
        self.reports.windows(2).all(|w| w[0].percent <= w[1].percent)
    }
}

impl ProgressListener for ProgressRecorder {
    fn set_progress(&mut self, percent: u32, task: Option<&str>) {
        self.reports.push(Progress {
            percent,
            task: task.map(str::to_owned),
        });
    }
}

/// Progress listener that maps weighted subtasks onto a parent's range.
///
/// The parent receives `(work * 100 + subtask_work * percent) / total_work`,
/// where `work` is the weight of all completed subtasks.
pub struct HierarchicalProgress<'a> {
    work: i32,
    subtask_work: i32,
    total_work: i32,
    task_name: Option<&'static str>,
    parent: Option<&'a mut dyn ProgressListener>,
}

impl<'a> HierarchicalProgress<'a> {
    /// Create a listener whose subtasks share `total_work` units.
    pub fn new(total_work: i32, parent: Option<&'a mut dyn ProgressListener>) -> Self {
        Self {
            work: 0,
            subtask_work: 1,
            total_work: total_work.max(1),
            task_name: None,
            parent,
        }
    }

    /// Start a subtask weighing `work` units; a negative weight takes what is left.
    pub fn set_subtask_work(&mut self, work: i32, task_name: Option<&'static str>) {
        let work = if work < 0 {
            self.total_work - self.work
        } else {
            work
        };
        debug_assert!(self.work + work <= self.total_work);
        self.subtask_work = work;
        self.task_name = task_name;
        self.set_progress(0, task_name);
    }

    /// Mark the running subtask as finished.
    pub fn complete_subtask(&mut self) {
        self.set_progress(100, self.task_name);
        self.work += self.subtask_work;
    }
}

impl ProgressListener for HierarchicalProgress<'_> {
    fn set_progress(&mut self, percent: u32, task: Option<&str>) {
        debug_assert!(percent <= 100);
        let task = task.or(self.task_name);
        if let Some(parent) = self.parent.as_deref_mut() {
            let percent = percent.min(100) as i32;
            let mapped = (self.work * 100 + self.subtask_work * percent) / self.total_work;
            parent.set_progress(mapped.clamp(0, 100) as u32, task);
        }
    }
}

/// Report `done / total` as a percentage, throttled to every `mask + 1` steps.
pub(crate) fn report_every(
    progress: &mut dyn ProgressListener,
    done: usize,
    total: usize,
    mask: usize,
) {
    if done & mask == 0 && total > 0 {
        progress.set_progress((done * 100 / total).min(100) as u32, None);
    }
}
