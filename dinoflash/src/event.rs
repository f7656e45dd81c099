//! Ordered event channel between provisioning components and the operator UI.
//!
//! Every component reports through an [`EventSink`]. Events are delivered in
//! send order over a `std::sync::mpsc` channel; a consumer that has gone away
//! never affects the sender.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::device::ScanResult;
use crate::lifecycle::WorkflowState;

/// Audible/visual cue requested from the operator UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    /// A long operation started.
    Start,
    /// A phase completed successfully.
    Success,
    /// A phase failed and needs the operator.
    Error,
}

impl Tone {
    /// Suggested `(frequency_hz, duration_ms)` for UIs that can beep.
    pub fn pitch(self) -> (u32, u32) {
        match self {
            Self::Start => (800, 150),
            Self::Success => (1200, 400),
            Self::Error => (400, 800),
        }
    }
}

/// A message on the event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Human-readable log line.
    Line(String),
    /// Progress of the operation currently shown, in percent.
    Progress(u8),
    /// Start showing a progress indicator.
    ShowProgress,
    /// Hide the progress indicator.
    HideProgress,
    /// The lifecycle controller changed state.
    State(WorkflowState),
    /// The port scanner observed a different result.
    Detection(ScanResult),
    /// Completion signal.
    Signal(Tone),
}

/// Cloneable sending half of the event channel.
///
/// A sink may also keep a transcript of every [`Event::Line`] it sends, which
/// the lifecycle controller attaches to inventory reports.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<Event>>,
    transcript: Option<Arc<Mutex<Vec<String>>>>,
}

impl EventSink {
    /// Wrap an existing channel sender.
    pub fn new(tx: Sender<Event>) -> Self {
        Self {
            tx: Some(tx),
            transcript: None,
        }
    }

    /// Create a sink and its receiving end.
    pub fn channel() -> (Self, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Self::new(tx), rx)
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self::default()
    }

    /// Record sent lines into a shared transcript.
    #[must_use]
    pub fn with_transcript(mut self) -> Self {
        self.transcript = Some(Arc::new(Mutex::new(Vec::new())));
        self
    }

    /// Send an event. Delivery failures are ignored.
    pub fn send(&self, event: Event) {
        if let Event::Line(text) = &event {
            debug!("{text}");
            if let Some(transcript) = &self.transcript {
                if let Ok(mut lines) = transcript.lock() {
                    lines.push(text.clone());
                }
            }
        }

        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// Send a log line.
    pub fn line(&self, text: impl Into<String>) {
        self.send(Event::Line(text.into()));
    }

    /// Send a progress update.
    pub fn progress(&self, percent: u8) {
        self.send(Event::Progress(percent.min(100)));
    }

    /// Request a completion signal.
    pub fn signal(&self, tone: Tone) {
        self.send(Event::Signal(tone));
    }

    /// Snapshot of the transcript (empty if none is kept).
    pub fn transcript(&self) -> Vec<String> {
        self.transcript
            .as_ref()
            .and_then(|t| t.lock().ok().map(|lines| lines.clone()))
            .unwrap_or_default()
    }

    /// Drop all recorded lines.
    pub fn clear_transcript(&self) {
        if let Some(transcript) = &self.transcript {
            if let Ok(mut lines) = transcript.lock() {
                lines.clear();
            }
        }
    }
}

/// Collapses progress updates so the displayed value never goes backwards.
#[derive(Debug, Default, Clone)]
pub struct ProgressGauge {
    shown: Option<u8>,
}

impl ProgressGauge {
    /// Forget the displayed value (call on [`Event::ShowProgress`]).
    pub fn reset(&mut self) {
        self.shown = None;
    }

    /// Offer a new value; returns it only if it advances the display.
    pub fn update(&mut self, percent: u8) -> Option<u8> {
        let percent = percent.min(100);
        match self.shown {
            Some(shown) if percent <= shown => None,
            _ => {
                self.shown = Some(percent);
                Some(percent)
            },
        }
    }

    /// Currently displayed value.
    pub fn value(&self) -> Option<u8> {
        self.shown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_send_order() {
        let (sink, rx) = EventSink::channel();
        sink.send(Event::ShowProgress);
        sink.line("a");
        sink.progress(10);
        sink.line("b");
        sink.send(Event::HideProgress);

        let got: Vec<Event> = rx.try_iter().collect();
        assert_eq!(
            got,
            vec![
                Event::ShowProgress,
                Event::Line("a".into()),
                Event::Progress(10),
                Event::Line("b".into()),
                Event::HideProgress,
            ]
        );
    }

    #[test]
    fn test_send_after_receiver_dropped_is_silent() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.line("nobody listening");
        sink.progress(50);
    }

    #[test]
    fn test_transcript_is_shared_between_clones() {
        let sink = EventSink::discard().with_transcript();
        let clone = sink.clone();
        sink.line("one");
        clone.line("two");
        clone.progress(3);
        assert_eq!(sink.transcript(), vec!["one", "two"]);

        sink.clear_transcript();
        assert!(clone.transcript().is_empty());
    }

    #[test]
    fn test_gauge_never_regresses() {
        let mut gauge = ProgressGauge::default();
        assert_eq!(gauge.update(5), Some(5));
        assert_eq!(gauge.update(40), Some(40));
        assert_eq!(gauge.update(12), None);
        assert_eq!(gauge.update(40), None);
        assert_eq!(gauge.update(200), Some(100));
        assert_eq!(gauge.value(), Some(100));

        gauge.reset();
        assert_eq!(gauge.update(1), Some(1));
    }
}
