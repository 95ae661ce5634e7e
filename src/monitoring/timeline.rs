//! Execution Timeline
//!
//! Tracks step start/end times for generating execution
//! reports and Gantt charts. Measured durations can be fed back into the
//! dependency graph to compute the measured critical path.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step stored an output
    Completed,
    /// Step was skipped after it started
    Skipped,
    /// Step failed
    Failed,
}

impl EventType {
    fn ends_step(&self) -> bool {
        !matches!(self, EventType::Started)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step_number: u32,
    pub label: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Tracks the execution timeline of a workflow.
///
/// Records when each step starts and resolves, enabling generation of
/// Gantt charts and timing reports.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step_number: u32, label: impl Into<String>, event_type: EventType) {
        self.add_event_at(step_number, label, event_type, Instant::now());
    }

    /// Records an event observed at an earlier instant (from a step task).
    pub fn add_event_at(
        &mut self,
        step_number: u32,
        label: impl Into<String>,
        event_type: EventType,
        timestamp: Instant,
    ) {
        self.events.push(TimelineEvent {
            step_number,
            label: label.into(),
            event_type,
            timestamp,
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// (start, end) offsets per step that both started and resolved.
    fn spans(&self) -> Vec<(u32, String, Duration, Duration)> {
        let mut starts: HashMap<u32, (String, Duration)> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time);
            if event.event_type.ends_step() {
                if let Some((label, start)) = starts.remove(&event.step_number) {
                    spans.push((event.step_number, label, start, offset));
                }
            } else {
                starts.insert(event.step_number, (event.label.clone(), offset));
            }
        }

        spans.sort_by_key(|(n, _, start, _)| (*start, *n));
        spans
    }

    /// Measured duration per step number.
    pub fn durations(&self) -> HashMap<u32, Duration> {
        self.spans()
            .into_iter()
            .map(|(n, _, start, end)| (n, end.saturating_sub(start)))
            .collect()
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each step is shown as a bar indicating when it ran
    /// relative to the total execution time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let spans = self.spans();
        let total_time = spans
            .iter()
            .map(|(_, _, _, end)| end.as_millis())
            .max()
            .unwrap_or(0);

        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for (step_number, label, start, end) in spans {
            let start_ms = start.as_millis();
            let end_ms = end.as_millis();
            let start_pos = (start_ms as f64 * scale) as usize;
            let width = ((end_ms - start_ms) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{:>3} {} |{:<50}| ({} ms)\n",
                step_number,
                truncate(&label, 12),
                bar,
                end_ms - start_ms
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
