//! Tool signals and measurement events
//!
//! Tool adapters publish raw [`ToolSignal`]s on a shared bus; the
//! coordinator normalizes them into records and republishes
//! [`MeasurementEvent`]s to its subscribers through the same [`SignalBus`].

use crate::annotation::{AnnotationId, AnnotationRecord, Correlation, ImagePoint, ToolKind};
use crate::measurement::PixelSpacing;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Raw shape data captured by a drawing surface
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawCapture {
    /// Points in the order the tool defines them; regions give two corners
    pub points: Vec<ImagePoint>,
    pub image_id: String,
    pub viewport_id: String,
    /// Calibration of the image; the coordinator default applies when absent
    pub pixel_spacing: Option<PixelSpacing>,
    pub text: Option<String>,
    pub correlation: Correlation,
}

impl RawCapture {
    pub fn new(points: Vec<ImagePoint>, image_id: impl Into<String>, viewport_id: impl Into<String>) -> Self {
        Self {
            points,
            image_id: image_id.into(),
            viewport_id: viewport_id.into(),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_pixel_spacing(mut self, spacing: PixelSpacing) -> Self {
        self.pixel_spacing = Some(spacing);
        self
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }
}

/// Raw lifecycle signal emitted by a tool adapter
#[derive(Debug, Clone, PartialEq)]
pub enum ToolSignal {
    Completed { tool: ToolKind, id: AnnotationId, capture: RawCapture },
    Modified { tool: ToolKind, id: AnnotationId, capture: RawCapture },
    Removed { tool: ToolKind, id: AnnotationId },
}

impl ToolSignal {
    pub fn tool(&self) -> ToolKind {
        match self {
            ToolSignal::Completed { tool, .. }
            | ToolSignal::Modified { tool, .. }
            | ToolSignal::Removed { tool, .. } => *tool,
        }
    }
}

/// Normalized event published by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementEvent {
    Added(AnnotationRecord),
    Modified(AnnotationRecord),
    Removed { kind: ToolKind, id: AnnotationId },
}

impl MeasurementEvent {
    pub fn annotation_id(&self) -> AnnotationId {
        match self {
            MeasurementEvent::Added(record) | MeasurementEvent::Modified(record) => record.id(),
            MeasurementEvent::Removed { id, .. } => *id,
        }
    }
}

/// Typed publish/subscribe channel owned by the coordinator.
///
/// Adapters get clones of the signal sender; subscribers get their own
/// event receivers.
#[derive(Debug)]
pub struct SignalBus {
    signal_tx: Sender<ToolSignal>,
    signal_rx: Receiver<ToolSignal>,
    subscribers: Vec<Sender<MeasurementEvent>>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus {
    pub fn new() -> Self {
        let (signal_tx, signal_rx) = unbounded();
        Self { signal_tx, signal_rx, subscribers: Vec::new() }
    }

    /// Sender handed to tool adapters
    pub fn sender(&self) -> Sender<ToolSignal> {
        self.signal_tx.clone()
    }

    /// Every signal published so far, oldest first
    pub fn drain_signals(&self) -> Vec<ToolSignal> {
        self.signal_rx.try_iter().collect()
    }

    pub fn subscribe(&mut self) -> Receiver<MeasurementEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver to every live subscriber, forgetting dropped ones
    pub fn publish(&mut self, event: MeasurementEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signals_drain_in_order() {
        let bus = SignalBus::new();
        let sender = bus.sender();
        let (first, second) = (AnnotationId::new_v4(), AnnotationId::new_v4());
        sender.send(ToolSignal::Removed { tool: ToolKind::Length, id: first }).unwrap();
        sender.send(ToolSignal::Removed { tool: ToolKind::Angle, id: second }).unwrap();

        let drained = bus.drain_signals();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], ToolSignal::Removed { tool: ToolKind::Length, id: first });
        assert_eq!(drained[1].tool(), ToolKind::Angle);
        assert!(bus.drain_signals().is_empty());
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let mut bus = SignalBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        let id = AnnotationId::new_v4();
        bus.publish(MeasurementEvent::Removed { kind: ToolKind::Length, id });

        assert_eq!(a.try_recv().unwrap().annotation_id(), id);
        assert_eq!(b.try_recv().unwrap().annotation_id(), id);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let mut bus = SignalBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(MeasurementEvent::Removed { kind: ToolKind::Angle, id: AnnotationId::new_v4() });
        assert_eq!(bus.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }
}
