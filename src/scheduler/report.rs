use std::fmt::{Display, Formatter, Write};
use std::time::Duration;

use serde::Serialize;

use crate::core::{DatasetId, JobId, ShuffleId, StageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    TimedOut,
    Killed,
    /// Reported after the scheduler had stopped waiting for this attempt.
    Stale,
}

/// One task attempt as seen by the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub stage: StageId,
    pub partition: usize,
    pub attempt: u32,
    /// Time between the start of the job and the dispatch of the attempt.
    pub offset: Duration,
    pub duration: Duration,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub id: StageId,
    pub kind: &'static str,
    pub dataset: DatasetId,
    pub shuffle: Option<ShuffleId>,
    /// Number of partitions the stage was submitted with.
    pub partitions: usize,
    pub parents: Vec<StageId>,
    /// How many times the job was planned before this stage ran.
    pub attempt: u32,
    pub duration: Duration,
}

/// Execution metrics of one job.
///
/// Available through `Context::last_job_report` after every action, whether
/// it succeeded or not.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobReport {
    pub job: JobId,
    pub stages: Vec<StageRecord>,
    pub tasks: Vec<TaskRecord>,
    pub duration: Duration,
}

impl JobReport {
    pub(crate) fn new(job: JobId) -> Self {
        Self {
            job,
            ..Self::default()
        }
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn shuffle_stage_count(&self) -> usize {
        self.stages.iter().filter(|s| s.shuffle.is_some()).count()
    }

    /// Attempts with the given status, across all stages.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Renders the stages of the job as a Mermaid diagram, color-coded by
    /// stage duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let (min_time, max_time) = bounds(self.stages.iter().map(|s| s.duration));

        for stage in &self.stages {
            let t = (stage.duration.as_secs_f64() - min_time) / (max_time - min_time);
            let shuffle = match stage.shuffle {
                Some(shuffle) => format!(" -> {shuffle}"),
                None => String::new(),
            };

            let _ = writeln!(
                f,
                "    {}[\"{}: {}\\n{} x{}{}\\n{:.2?}\"]",
                stage.id.index(),
                stage.id,
                stage.kind,
                stage.dataset,
                stage.partitions,
                shuffle,
                stage.duration
            );
            let _ = writeln!(f, "    style {} fill:{}", stage.id.index(), gradient(t));
        }

        for stage in &self.stages {
            for parent in &stage.parents {
                let _ = writeln!(f, "    {} --> {}", parent.index(), stage.id.index());
            }
        }

        f
    }

    /// Renders every task attempt as a waterfall chart in SVG.
    pub fn render_waterfall(&self) -> String {
        if self.tasks.is_empty() {
            return r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg">
            <text x="10" y="30" font-family="sans-serif">No tasks ran</text>
        </svg>"#
                .to_string();
        }

        let mut tasks: Vec<&TaskRecord> = self.tasks.iter().collect();
        tasks.sort_by_key(|t| t.offset);

        let layout = WaterfallLayout::default();
        let end = tasks
            .iter()
            .map(|t| t.offset + t.duration)
            .max()
            .unwrap_or_default();
        let total_micros = end.as_micros().max(1) as f64;

        let mut svg = String::with_capacity(tasks.len() * 400);
        let _ = write!(
            svg,
            r#"<svg width="{}" height="{}" xmlns="http://www.w3.org/2000/svg"><style>{}</style><rect width="100%" height="100%" fill="white" />"#,
            layout.total_width(),
            layout.total_height(tasks.len()),
            WATERFALL_CSS
        );

        let steps = 5;
        for i in 0..=steps {
            let pct = i as f64 / steps as f64;
            let x = (layout.label_width + layout.padding) as f64 + layout.chart_width as f64 * pct;
            let _ = write!(
                svg,
                r#"<line x1="{x:.1}" y1="{y1}" x2="{x:.1}" y2="100%" class="grid-line" /><text x="{x:.1}" y="{y_text}" text-anchor="middle" class="axis-label">{label}</text>"#,
                y1 = layout.header_height,
                y_text = layout.header_height - 5,
                label = format_micros(total_micros * pct)
            );
        }

        for (i, task) in tasks.iter().enumerate() {
            let y_pos = layout.header_height + i as u32 * layout.row_height;
            let y_center = y_pos + layout.row_height / 2;
            let label = format!(
                "{} / partition {} #{}",
                task.stage, task.partition, task.attempt
            );

            let offset = task.offset.as_micros() as f64;
            let micros = task.duration.as_micros() as f64;
            let bar_x = (layout.label_width + layout.padding) as f64
                + offset / total_micros * layout.chart_width as f64;
            let bar_w = (micros / total_micros * layout.chart_width as f64).max(1.0);

            let _ = write!(
                svg,
                r#"<rect x="0" y="{y_pos}" width="100%" height="{h}" class="task-row" /><text x="{pad}" y="{y_center}" class="label" dominant-baseline="middle">{label}</text><rect x="{bar_x:.1}" y="{y_bar}" width="{bar_w:.1}" height="{h_bar}" class="bar {status}"><title>{label}: {dur:.2?}</title></rect><text x="{x_text:.1}" y="{y_center}" class="time" dominant-baseline="middle">{text}</text>"#,
                h = layout.row_height,
                pad = layout.padding,
                y_bar = y_pos + 5,
                h_bar = layout.row_height - 10,
                status = task.status,
                dur = task.duration,
                x_text = bar_x + bar_w + 5.0,
                text = format_micros(micros),
            );
        }

        svg.push_str("</svg>");
        svg
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed-out",
            TaskStatus::Killed => "killed",
            TaskStatus::Stale => "stale",
        })
    }
}

const WATERFALL_CSS: &str = r#"
        .task-row:nth-child(even) { fill: #f9f9f9; }
        .task-row:nth-child(odd) { fill: #ffffff; }
        text { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Helvetica, Arial, sans-serif; font-size: 12px; }
        .bar { fill: #3b82f6; rx: 4; }
        .bar.failed, .bar.timed-out { fill: #ef4444; }
        .bar.killed, .bar.stale { fill: #9ca3af; }
        .label { fill: #333; }
        .time { fill: #666; font-size: 11px; }
        .grid-line { stroke: #e5e7eb; stroke-width: 1; }
        .axis-label { fill: #9ca3af; font-size: 10px; }"#;

#[derive(Debug, Clone, Copy)]
struct WaterfallLayout {
    row_height: u32,
    label_width: u32,
    chart_width: u32,
    padding: u32,
    header_height: u32,
    text_space: u32,
}

impl Default for WaterfallLayout {
    fn default() -> Self {
        Self {
            row_height: 24,
            label_width: 260,
            chart_width: 800,
            padding: 10,
            header_height: 30,
            text_space: 80,
        }
    }
}

impl WaterfallLayout {
    fn total_width(&self) -> u32 {
        self.label_width + self.chart_width + (self.padding * 3) + self.text_space
    }

    fn total_height(&self, task_count: usize) -> u32 {
        self.header_height + (task_count as u32 * self.row_height) + self.padding
    }
}

fn format_micros(micros: f64) -> String {
    if micros < 1000.0 {
        format!("{:.0}µs", micros)
    } else {
        format!("{:.2}ms", micros / 1000.0)
    }
}

/// Shortest and longest duration in seconds, never equal.
fn bounds(durations: impl Iterator<Item = Duration>) -> (f64, f64) {
    let mut min_time = f64::MAX;
    let mut max_time = f64::MIN;
    for duration in durations {
        let secs = duration.as_secs_f64();
        min_time = min_time.min(secs);
        max_time = max_time.max(secs);
    }

    if min_time > max_time {
        min_time = 0.0;
        max_time = 0.0;
    }
    if (max_time - min_time).abs() < f64::EPSILON {
        max_time = min_time + 1.0;
    }
    (min_time, max_time)
}

/// 0.0 (Green) -> 0.5 (Yellow) -> 1.0 (Red)
fn gradient(t: f64) -> String {
    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };
    format!("#{:02X}{:02X}{:02X}", r, g, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> JobReport {
        let stage = |id, shuffle: Option<ShuffleId>, parents: Vec<StageId>, ms| StageRecord {
            id: StageId(id),
            kind: if shuffle.is_some() { "shuffle_map" } else { "result" },
            dataset: DatasetId(id),
            shuffle,
            partitions: 2,
            parents,
            attempt: 0,
            duration: Duration::from_millis(ms),
        };

        JobReport {
            job: JobId(3),
            stages: vec![
                stage(0, Some(ShuffleId(0)), vec![], 5),
                stage(1, None, vec![StageId(0)], 50),
            ],
            tasks: vec![TaskRecord {
                stage: StageId(0),
                partition: 1,
                attempt: 0,
                offset: Duration::from_millis(1),
                duration: Duration::from_millis(4),
                status: TaskStatus::TimedOut,
            }],
            duration: Duration::from_millis(60),
        }
    }

    #[test]
    fn test_mermaid_has_stages_and_edges() {
        let out = report().render_mermaid();
        assert!(out.starts_with("graph LR"));
        assert!(out.contains("stage 0: shuffle_map"));
        assert!(out.contains("0 --> 1"));
        assert!(out.contains("style 0 fill:#00FF00"));
        assert!(out.contains("style 1 fill:#FF0000"));
    }

    #[test]
    fn test_waterfall_marks_status() {
        let svg = report().render_waterfall();
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("bar timed-out"));
        assert!(svg.ends_with("</svg>"));

        assert!(JobReport::default().render_waterfall().contains("No tasks ran"));
    }

    #[test]
    fn test_counts() {
        let report = report();
        assert_eq!(report.stage_count(), 2);
        assert_eq!(report.shuffle_stage_count(), 1);
        assert_eq!(report.count(TaskStatus::TimedOut), 1);
        assert_eq!(report.count(TaskStatus::Succeeded), 0);
    }
}
