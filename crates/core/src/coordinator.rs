//! Measurement tool coordinator
//!
//! Keeps at most one measurement tool (length, angle, elliptical area,
//! rectangular area) active at a time. Text and arrow tools activate
//! independently. Raw tool signals are normalized into
//! [`AnnotationRecord`]s, kept in per-tool live lists and republished as
//! [`MeasurementEvent`]s.

use crate::annotation::{AnnotationGeometry, AnnotationId, AnnotationRecord, RecordResult, ToolKind};
use crate::events::{MeasurementEvent, RawCapture, SignalBus, ToolSignal};
use crate::measurement::{measure, MeasurementPrecision, PixelSpacing};
use crate::tools::{SurfaceTool, ToolAdapter, ToolHandle};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no {0} tool is registered")]
    UnknownTool(ToolKind),

    #[error("{0} tool is disabled")]
    Disabled(ToolKind),

    #[error("failed to activate {kind}: {reason}")]
    ActivationFailed { kind: ToolKind, reason: String },
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub precision: MeasurementPrecision,
    /// Used when a capture carries no (or an unusable) pixel spacing
    pub default_pixel_spacing: PixelSpacing,
}

/// Measurement-tool activation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolPhase {
    #[default]
    Idle,
    Activating(ToolKind),
    Active(ToolKind),
}

/// Snapshot of the live measurements, recomputed on every call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeasurementSummary {
    pub total: usize,
    pub by_kind: BTreeMap<ToolKind, usize>,
    pub by_viewport: BTreeMap<String, Vec<AnnotationId>>,
    pub by_image: BTreeMap<String, Vec<AnnotationId>>,
}

struct ToolSlot {
    adapter: Box<dyn ToolAdapter>,
    enabled: bool,
    /// Records owned by this tool, in completion order
    live: Vec<AnnotationRecord>,
}

impl ToolSlot {
    fn position(&self, id: AnnotationId) -> Option<usize> {
        self.live.iter().position(|r| r.id() == id)
    }
}

pub struct MeasurementToolCoordinator {
    config: CoordinatorConfig,
    slots: BTreeMap<ToolKind, ToolSlot>,
    phase: ToolPhase,
    bus: SignalBus,
}

impl std::fmt::Debug for MeasurementToolCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementToolCoordinator")
            .field("phase", &self.phase)
            .field("tools", &self.slots.keys().collect::<Vec<_>>())
            .field("subscribers", &self.bus.subscriber_count())
            .finish()
    }
}

impl MeasurementToolCoordinator {
    /// Coordinator with no tools registered
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            slots: BTreeMap::new(),
            phase: ToolPhase::Idle,
            bus: SignalBus::new(),
        }
    }

    /// Coordinator with a [`SurfaceTool`] for every tool kind, plus the
    /// handles input surfaces drive them through
    pub fn with_default_tools(config: CoordinatorConfig) -> (Self, BTreeMap<ToolKind, ToolHandle>) {
        let mut coordinator = Self::new(config);
        let mut handles = BTreeMap::new();
        for kind in ToolKind::ALL {
            let tool = SurfaceTool::new(kind);
            handles.insert(kind, tool.handle());
            coordinator.register_tool(Box::new(tool));
        }
        (coordinator, handles)
    }

    pub fn config(&self) -> CoordinatorConfig {
        self.config
    }

    /// Register `adapter` for its tool kind, returning the adapter it replaces.
    ///
    /// Live records of the kind are kept.
    pub fn register_tool(&mut self, mut adapter: Box<dyn ToolAdapter>) -> Option<Box<dyn ToolAdapter>> {
        let kind = adapter.kind();
        adapter.attach(self.bus.sender());

        match self.slots.get_mut(&kind) {
            Some(slot) => {
                let mut previous = std::mem::replace(&mut slot.adapter, adapter);
                if previous.is_active() {
                    if let Err(err) = previous.deactivate() {
                        log::warn!("replaced {kind} tool failed to deactivate: {err}");
                    }
                }
                if self.phase == ToolPhase::Active(kind) {
                    self.phase = ToolPhase::Idle;
                }
                Some(previous)
            }
            None => {
                self.slots.insert(kind, ToolSlot { adapter, enabled: true, live: Vec::new() });
                None
            }
        }
    }

    /// Sender for raw signals from tools not registered as adapters
    pub fn signal_sender(&self) -> Sender<ToolSignal> {
        self.bus.sender()
    }

    pub fn subscribe(&mut self) -> Receiver<MeasurementEvent> {
        self.bus.subscribe()
    }

    // ---- activation ----

    pub fn phase(&self) -> ToolPhase {
        self.phase
    }

    /// The active measurement tool
    pub fn active_tool(&self) -> Option<ToolKind> {
        match self.phase {
            ToolPhase::Active(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn is_tool_active(&self, kind: ToolKind) -> bool {
        self.slots.get(&kind).is_some_and(|slot| slot.adapter.is_active())
    }

    /// Activate `kind`.
    ///
    /// Activating a measurement tool deactivates the other measurement
    /// tools first. If activation fails the previously active tool is
    /// re-activated.
    pub fn activate_tool(&mut self, kind: ToolKind) -> CoordinatorResult<()> {
        let slot = self.slots.get_mut(&kind).ok_or(CoordinatorError::UnknownTool(kind))?;
        if !slot.enabled {
            return Err(CoordinatorError::Disabled(kind));
        }

        if !kind.is_measurement() {
            return slot
                .adapter
                .activate()
                .map_err(|err| CoordinatorError::ActivationFailed { kind, reason: err.to_string() });
        }

        let previous = self.active_tool();
        if previous == Some(kind) && self.is_tool_active(kind) {
            return Ok(());
        }

        self.phase = ToolPhase::Activating(kind);
        for other in ToolKind::MEASUREMENTS {
            if other == kind {
                continue;
            }
            if let Some(slot) = self.slots.get_mut(&other) {
                if slot.adapter.is_active() {
                    if let Err(err) = slot.adapter.deactivate() {
                        log::warn!("failed to deactivate {other} tool: {err}");
                    }
                }
            }
        }

        let activated = match self.slots.get_mut(&kind) {
            Some(slot) => slot.adapter.activate(),
            None => return Err(CoordinatorError::UnknownTool(kind)),
        };

        match activated {
            Ok(()) => {
                self.phase = ToolPhase::Active(kind);
                log::debug!("activated {kind} tool");
                Ok(())
            }
            Err(err) => {
                log::error!("failed to activate {kind} tool: {err}");
                self.rollback(previous);
                Err(CoordinatorError::ActivationFailed { kind, reason: err.to_string() })
            }
        }
    }

    fn rollback(&mut self, previous: Option<ToolKind>) {
        self.phase = ToolPhase::Idle;
        let Some(previous) = previous else {
            return;
        };
        let Some(slot) = self.slots.get_mut(&previous) else {
            return;
        };
        match slot.adapter.activate() {
            Ok(()) => self.phase = ToolPhase::Active(previous),
            Err(err) => log::error!("rollback could not re-activate {previous} tool: {err}"),
        }
    }

    /// Deactivate `kind`; false if it was not active
    pub fn deactivate_tool(&mut self, kind: ToolKind) -> bool {
        let Some(slot) = self.slots.get_mut(&kind) else {
            return false;
        };
        let was_active = slot.adapter.is_active();
        if let Err(err) = slot.adapter.deactivate() {
            log::warn!("failed to deactivate {kind} tool: {err}");
        }
        if self.active_tool() == Some(kind) {
            self.phase = ToolPhase::Idle;
        }
        was_active
    }

    pub fn deactivate_all(&mut self) {
        for (kind, slot) in &mut self.slots {
            if let Err(err) = slot.adapter.deactivate() {
                log::warn!("failed to deactivate {kind} tool: {err}");
            }
        }
        self.phase = ToolPhase::Idle;
    }

    /// Enable or disable a tool; disabling the active tool deactivates it.
    /// Returns false for an unregistered tool.
    pub fn set_tool_enabled(&mut self, kind: ToolKind, enabled: bool) -> bool {
        let Some(slot) = self.slots.get_mut(&kind) else {
            return false;
        };
        slot.enabled = enabled;
        if !enabled {
            self.deactivate_tool(kind);
        }
        true
    }

    pub fn is_tool_enabled(&self, kind: ToolKind) -> bool {
        self.slots.get(&kind).is_some_and(|slot| slot.enabled)
    }

    // ---- signals ----

    /// Normalize every pending tool signal and publish the resulting events.
    ///
    /// Returns the number of events published.
    pub fn process_signals(&mut self) -> usize {
        let mut published = 0;
        for signal in self.bus.drain_signals() {
            if let Some(event) = self.handle_signal(signal) {
                self.bus.publish(event);
                published += 1;
            }
        }
        published
    }

    fn handle_signal(&mut self, signal: ToolSignal) -> Option<MeasurementEvent> {
        let kind = signal.tool();
        let Some(slot) = self.slots.get(&kind) else {
            log::warn!("signal from unregistered {kind} tool dropped");
            return None;
        };

        match signal {
            ToolSignal::Completed { id, capture, .. } => {
                if slot.position(id).is_some() {
                    log::debug!("duplicate completion of {id} ignored");
                    return None;
                }
                let record = match self.normalize(kind, id, &capture) {
                    Ok(record) => record,
                    Err(err) => {
                        log::warn!("discarding invalid {kind} capture {id}: {err}");
                        return None;
                    }
                };
                self.slots.get_mut(&kind)?.live.push(record.clone());
                Some(MeasurementEvent::Added(record))
            }
            ToolSignal::Modified { id, capture, .. } => {
                let Some(index) = slot.position(id) else {
                    log::warn!("modification of unknown {kind} record {id} dropped");
                    return None;
                };
                let modified = match self.remeasure(&slot.live[index], &capture) {
                    Ok(record) => record,
                    Err(err) => {
                        log::warn!("discarding invalid edit of {kind} record {id}: {err}");
                        return None;
                    }
                };
                self.slots.get_mut(&kind)?.live[index] = modified.clone();
                Some(MeasurementEvent::Modified(modified))
            }
            ToolSignal::Removed { id, .. } => {
                let Some(index) = slot.position(id) else {
                    log::warn!("removal of unknown {kind} record {id} dropped");
                    return None;
                };
                self.slots.get_mut(&kind)?.live.remove(index);
                Some(MeasurementEvent::Removed { kind, id })
            }
        }
    }

    fn spacing_for(&self, capture: &RawCapture) -> PixelSpacing {
        match capture.pixel_spacing {
            Some(spacing) if spacing.is_valid() => spacing,
            Some(spacing) => {
                log::debug!("ignoring unusable pixel spacing {spacing:?}");
                self.config.default_pixel_spacing
            }
            None => self.config.default_pixel_spacing,
        }
    }

    fn normalize(&self, kind: ToolKind, id: AnnotationId, capture: &RawCapture) -> RecordResult<AnnotationRecord> {
        let geometry = AnnotationGeometry::from_points(kind, &capture.points)?;
        let measurement = measure(kind, &geometry, self.spacing_for(capture), self.config.precision);
        Ok(AnnotationRecord::new(kind, geometry, capture.image_id.clone(), capture.viewport_id.clone())?
            .with_id(id)
            .with_label(capture.text.clone())
            .with_measurement(measurement)
            .with_correlation(capture.correlation.clone()))
    }

    fn remeasure(&self, existing: &AnnotationRecord, capture: &RawCapture) -> RecordResult<AnnotationRecord> {
        let kind = existing.kind();
        let geometry = AnnotationGeometry::from_points(kind, &capture.points)?;
        let measurement = measure(kind, &geometry, self.spacing_for(capture), self.config.precision);
        let mut modified = existing.with_geometry(geometry, measurement)?;
        if capture.text.is_some() {
            modified.set_label(capture.text.clone());
        }
        Ok(modified)
    }

    // ---- queries ----

    fn records_of(&self, kinds: &[ToolKind]) -> Vec<AnnotationRecord> {
        kinds
            .iter()
            .filter_map(|kind| self.slots.get(kind))
            .flat_map(|slot| slot.live.iter().cloned())
            .collect()
    }

    /// Live measurements: length, angle, elliptical area, rectangular area
    pub fn get_all_measurements(&self) -> Vec<AnnotationRecord> {
        self.records_of(&ToolKind::MEASUREMENTS)
    }

    /// Live text and arrow annotations
    pub fn get_all_annotations(&self) -> Vec<AnnotationRecord> {
        self.records_of(&ToolKind::ANNOTATIONS)
    }

    pub fn get_all_records(&self) -> Vec<AnnotationRecord> {
        self.records_of(&ToolKind::ALL)
    }

    pub fn get_measurement_summary(&self) -> MeasurementSummary {
        let mut summary = MeasurementSummary::default();
        for record in self.get_all_measurements() {
            summary.total += 1;
            *summary.by_kind.entry(record.kind()).or_default() += 1;
            summary.by_viewport.entry(record.viewport_id().to_owned()).or_default().push(record.id());
            summary.by_image.entry(record.image_id().to_owned()).or_default().push(record.id());
        }
        summary
    }

    /// Remove a live measurement, publishing its removal
    pub fn remove_measurement(&mut self, id: AnnotationId) -> bool {
        for kind in ToolKind::MEASUREMENTS {
            let Some(slot) = self.slots.get_mut(&kind) else {
                continue;
            };
            let Some(index) = slot.position(id) else {
                continue;
            };
            slot.live.remove(index);
            slot.adapter.discard(id);
            self.bus.publish(MeasurementEvent::Removed { kind, id });
            return true;
        }
        false
    }

    /// Remove every live measurement, publishing one removal per record.
    /// Returns how many were removed.
    pub fn clear_measurements(&mut self) -> usize {
        let mut removed = Vec::new();
        for kind in ToolKind::MEASUREMENTS {
            if let Some(slot) = self.slots.get_mut(&kind) {
                for record in std::mem::take(&mut slot.live) {
                    slot.adapter.discard(record.id());
                    removed.push(MeasurementEvent::Removed { kind, id: record.id() });
                }
            }
        }
        let count = removed.len();
        for event in removed {
            self.bus.publish(event);
        }
        count
    }

    /// Rehydrate live lists from stored records without publishing events.
    ///
    /// Invalid records and records of unregistered tools are skipped.
    /// Returns how many were loaded.
    pub fn load_records(&mut self, records: &[AnnotationRecord]) -> usize {
        let mut loaded = 0;
        for record in records {
            if let Err(err) = record.validate() {
                log::warn!("skipping invalid record {}: {err}", record.id());
                continue;
            }
            let Some(slot) = self.slots.get_mut(&record.kind()) else {
                log::warn!("skipping record {} of unregistered {} tool", record.id(), record.kind());
                continue;
            };
            match slot.position(record.id()) {
                Some(index) => slot.live[index] = record.clone(),
                None => slot.live.push(record.clone()),
            }
            loaded += 1;
        }
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{ImagePoint, Unit};
    use crate::tools::{ToolError, ToolResult};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn p(x: f64, y: f64) -> ImagePoint {
        ImagePoint::new(x, y)
    }

    fn capture(points: Vec<ImagePoint>) -> RawCapture {
        RawCapture::new(points, "img-1", "vp-1")
    }

    fn coordinator() -> (MeasurementToolCoordinator, BTreeMap<ToolKind, ToolHandle>) {
        MeasurementToolCoordinator::with_default_tools(CoordinatorConfig::default())
    }

    /// Adapter whose activation can be made to fail
    struct ScriptedTool {
        kind: ToolKind,
        active: Arc<AtomicBool>,
        fail: Arc<AtomicBool>,
    }

    impl ScriptedTool {
        fn new(kind: ToolKind, fail: bool) -> (Self, Arc<AtomicBool>) {
            let fail = Arc::new(AtomicBool::new(fail));
            let tool = Self { kind, active: Arc::new(AtomicBool::new(false)), fail: fail.clone() };
            (tool, fail)
        }
    }

    impl ToolAdapter for ScriptedTool {
        fn kind(&self) -> ToolKind {
            self.kind
        }
        fn attach(&mut self, _signals: Sender<ToolSignal>) {}
        fn activate(&mut self) -> ToolResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ToolError::Rejected("no viewport".into()));
            }
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn deactivate(&mut self) -> ToolResult<()> {
            self.active.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_measurement_tools_are_mutually_exclusive() {
        let (mut coordinator, handles) = coordinator();
        for first in ToolKind::MEASUREMENTS {
            for second in ToolKind::MEASUREMENTS {
                if first == second {
                    continue;
                }
                coordinator.activate_tool(first).unwrap();
                coordinator.activate_tool(second).unwrap();

                assert_eq!(coordinator.active_tool(), Some(second));
                let active: Vec<ToolKind> = ToolKind::MEASUREMENTS
                    .into_iter()
                    .filter(|kind| handles[kind].is_active())
                    .collect();
                assert_eq!(active, vec![second], "after {first} then {second}");
            }
        }
    }

    #[test]
    fn test_annotation_tools_activate_independently() {
        let (mut coordinator, handles) = coordinator();
        coordinator.activate_tool(ToolKind::Length).unwrap();
        coordinator.activate_tool(ToolKind::Text).unwrap();
        coordinator.activate_tool(ToolKind::Arrow).unwrap();
        coordinator.activate_tool(ToolKind::Angle).unwrap();

        assert!(handles[&ToolKind::Text].is_active());
        assert!(handles[&ToolKind::Arrow].is_active());
        assert!(!handles[&ToolKind::Length].is_active());
        assert_eq!(coordinator.active_tool(), Some(ToolKind::Angle));

        coordinator.deactivate_all();
        assert_eq!(coordinator.phase(), ToolPhase::Idle);
        assert!(ToolKind::ALL.iter().all(|kind| !coordinator.is_tool_active(*kind)));
    }

    #[test]
    fn test_failed_activation_restores_previous_tool() {
        let (mut coordinator, handles) = coordinator();
        let (failing, _) = ScriptedTool::new(ToolKind::Angle, true);
        coordinator.register_tool(Box::new(failing));

        coordinator.activate_tool(ToolKind::Length).unwrap();
        let result = coordinator.activate_tool(ToolKind::Angle);

        assert!(matches!(result, Err(CoordinatorError::ActivationFailed { kind: ToolKind::Angle, .. })));
        assert_eq!(coordinator.active_tool(), Some(ToolKind::Length));
        assert!(handles[&ToolKind::Length].is_active());
        assert!(!coordinator.is_tool_active(ToolKind::Angle));
    }

    #[test]
    fn test_failed_rollback_leaves_coordinator_idle() {
        let mut coordinator = MeasurementToolCoordinator::new(CoordinatorConfig::default());
        let (length, length_fails) = ScriptedTool::new(ToolKind::Length, false);
        let (angle, _) = ScriptedTool::new(ToolKind::Angle, true);
        coordinator.register_tool(Box::new(length));
        coordinator.register_tool(Box::new(angle));

        coordinator.activate_tool(ToolKind::Length).unwrap();
        length_fails.store(true, Ordering::SeqCst);

        assert!(coordinator.activate_tool(ToolKind::Angle).is_err());
        assert_eq!(coordinator.phase(), ToolPhase::Idle);
        assert_eq!(coordinator.active_tool(), None);
    }

    #[test]
    fn test_unknown_and_disabled_tools() {
        let mut empty = MeasurementToolCoordinator::new(CoordinatorConfig::default());
        assert_eq!(empty.activate_tool(ToolKind::Length), Err(CoordinatorError::UnknownTool(ToolKind::Length)));

        let (mut coordinator, _) = coordinator();
        coordinator.activate_tool(ToolKind::Angle).unwrap();
        assert!(coordinator.set_tool_enabled(ToolKind::Angle, false));
        assert_eq!(coordinator.active_tool(), None);
        assert_eq!(coordinator.activate_tool(ToolKind::Angle), Err(CoordinatorError::Disabled(ToolKind::Angle)));

        coordinator.set_tool_enabled(ToolKind::Angle, true);
        assert!(coordinator.activate_tool(ToolKind::Angle).is_ok());
    }

    #[test]
    fn test_completion_is_normalized_and_published() {
        let (mut coordinator, handles) = coordinator();
        let events = coordinator.subscribe();
        coordinator.activate_tool(ToolKind::Length).unwrap();

        let id = handles[&ToolKind::Length]
            .complete(capture(vec![p(0.0, 0.0), p(3.0, 4.0)]).with_pixel_spacing(PixelSpacing::uniform(0.5)))
            .unwrap();
        assert_eq!(coordinator.process_signals(), 1);

        let MeasurementEvent::Added(record) = events.try_recv().unwrap() else {
            panic!("expected an added event");
        };
        assert_eq!(record.id(), id);
        let value = record.measurement().unwrap();
        assert_eq!(value.value, 2.5);
        assert_eq!(value.unit, Unit::Millimeters);
    }

    #[test]
    fn test_reference_measurements() {
        let (mut coordinator, handles) = coordinator();

        coordinator.activate_tool(ToolKind::Angle).unwrap();
        handles[&ToolKind::Angle].complete(capture(vec![p(1.0, 0.0), p(0.0, 0.0), p(0.0, 1.0)])).unwrap();
        coordinator.activate_tool(ToolKind::RectangularArea).unwrap();
        handles[&ToolKind::RectangularArea].complete(capture(vec![p(4.0, 3.0), p(0.0, 0.0)])).unwrap();
        coordinator.process_signals();

        let measurements = coordinator.get_all_measurements();
        let angle = measurements[0].measurement().unwrap();
        assert_eq!((angle.value, angle.unit), (90.0, Unit::Degrees));
        let area = measurements[1].measurement().unwrap();
        assert_eq!(area.value, 12.0);
        assert_eq!(area.perimeter, Some(14.0));
        assert_eq!(area.label(2), "12.00 mm²");
    }

    #[test]
    fn test_angle_vertex_is_the_middle_point() {
        let (mut coordinator, handles) = coordinator();
        coordinator.activate_tool(ToolKind::Angle).unwrap();
        let angle = &handles[&ToolKind::Angle];
        // Vertex at (1,0): the arms to (0,0) and (0,1) meet at 45 degrees
        angle.complete(capture(vec![p(0.0, 0.0), p(1.0, 0.0), p(0.0, 1.0)])).unwrap();
        angle.complete(capture(vec![p(0.0, 1.0), p(0.0, 0.0), p(1.0, 0.0)])).unwrap();
        coordinator.process_signals();

        let degrees: Vec<f64> = coordinator
            .get_all_measurements()
            .iter()
            .map(|record| record.measurement().unwrap().value)
            .collect();
        assert_eq!(degrees, vec![45.0, 90.0]);
    }

    #[test]
    fn test_invalid_and_unknown_signals_are_dropped() {
        let (mut coordinator, handles) = coordinator();
        let events = coordinator.subscribe();
        let sender = coordinator.signal_sender();
        coordinator.activate_tool(ToolKind::Length).unwrap();

        handles[&ToolKind::Length].complete(capture(vec![p(0.0, 0.0)])).unwrap();
        handles[&ToolKind::Length].modify(AnnotationId::new_v4(), capture(vec![p(0.0, 0.0), p(1.0, 1.0)])).unwrap();
        handles[&ToolKind::Length].remove(AnnotationId::new_v4()).unwrap();

        let id = AnnotationId::new_v4();
        let completed = ToolSignal::Completed {
            tool: ToolKind::Length,
            id,
            capture: capture(vec![p(0.0, 0.0), p(1.0, 0.0)]),
        };
        sender.send(completed.clone()).unwrap();
        sender.send(completed).unwrap();

        assert_eq!(coordinator.process_signals(), 1);
        assert_eq!(events.try_iter().count(), 1);
        assert_eq!(coordinator.get_all_measurements().len(), 1);
    }

    #[test]
    fn test_modification_keeps_identity() {
        let (mut coordinator, handles) = coordinator();
        let events = coordinator.subscribe();
        coordinator.activate_tool(ToolKind::Length).unwrap();
        let handle = &handles[&ToolKind::Length];

        let id = handle.complete(capture(vec![p(0.0, 0.0), p(1.0, 0.0)])).unwrap();
        coordinator.process_signals();
        let original = coordinator.get_all_measurements().remove(0);

        handle.modify(id, capture(vec![p(0.0, 0.0), p(6.0, 8.0)])).unwrap();
        coordinator.process_signals();

        let modified = coordinator.get_all_measurements().remove(0);
        assert_eq!(modified.id(), id);
        assert_eq!(modified.created_at(), original.created_at());
        assert_eq!(modified.measurement().unwrap().value, 10.0);
        assert!(matches!(events.try_iter().last(), Some(MeasurementEvent::Modified(_))));
    }

    #[test]
    fn test_measurements_follow_tool_order() {
        let (mut coordinator, handles) = coordinator();
        coordinator.activate_tool(ToolKind::Angle).unwrap();
        let angle = handles[&ToolKind::Angle].complete(capture(vec![p(1.0, 0.0), p(0.0, 0.0), p(0.0, 1.0)])).unwrap();
        coordinator.activate_tool(ToolKind::Length).unwrap();
        let first = handles[&ToolKind::Length].complete(capture(vec![p(0.0, 0.0), p(1.0, 0.0)])).unwrap();
        let second = handles[&ToolKind::Length].complete(capture(vec![p(0.0, 0.0), p(2.0, 0.0)])).unwrap();
        coordinator.activate_tool(ToolKind::Text).unwrap();
        handles[&ToolKind::Text].complete(capture(vec![p(5.0, 5.0)]).with_text("note")).unwrap();
        coordinator.process_signals();

        let ids: Vec<AnnotationId> = coordinator.get_all_measurements().iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![first, second, angle]);
        assert_eq!(coordinator.get_all_annotations()[0].label(), Some("note"));
        assert_eq!(coordinator.get_all_records().len(), 4);
    }

    #[test]
    fn test_summary_groups_by_viewport_and_image() {
        let (mut coordinator, handles) = coordinator();
        coordinator.activate_tool(ToolKind::Length).unwrap();
        let handle = &handles[&ToolKind::Length];
        let a = handle.complete(RawCapture::new(vec![p(0.0, 0.0), p(1.0, 0.0)], "img-1", "vp-1")).unwrap();
        let b = handle.complete(RawCapture::new(vec![p(0.0, 0.0), p(1.0, 0.0)], "img-2", "vp-1")).unwrap();
        let c = handle.complete(RawCapture::new(vec![p(0.0, 0.0), p(1.0, 0.0)], "img-2", "vp-2")).unwrap();
        coordinator.process_signals();

        let summary = coordinator.get_measurement_summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_kind[&ToolKind::Length], 3);
        assert_eq!(summary.by_viewport["vp-1"], vec![a, b]);
        assert_eq!(summary.by_viewport["vp-2"], vec![c]);
        assert_eq!(summary.by_image["img-2"], vec![b, c]);
    }

    #[test]
    fn test_remove_and_clear_publish_removals() {
        let (mut coordinator, handles) = coordinator();
        let events = coordinator.subscribe();
        coordinator.activate_tool(ToolKind::EllipticalArea).unwrap();
        let handle = &handles[&ToolKind::EllipticalArea];
        let first = handle.complete(capture(vec![p(0.0, 0.0), p(4.0, 2.0)])).unwrap();
        handle.complete(capture(vec![p(0.0, 0.0), p(2.0, 2.0)])).unwrap();
        handle.complete(capture(vec![p(0.0, 0.0), p(6.0, 2.0)])).unwrap();
        coordinator.process_signals();
        events.try_iter().count();

        assert!(coordinator.remove_measurement(first));
        assert!(!coordinator.remove_measurement(first));
        assert_eq!(coordinator.clear_measurements(), 2);
        assert!(coordinator.get_all_measurements().is_empty());

        let removals = events.try_iter().filter(|e| matches!(e, MeasurementEvent::Removed { .. })).count();
        assert_eq!(removals, 3);
    }

    #[test]
    fn test_load_records_is_silent() {
        let (mut source, handles) = coordinator();
        source.activate_tool(ToolKind::Length).unwrap();
        handles[&ToolKind::Length].complete(capture(vec![p(0.0, 0.0), p(1.0, 0.0)])).unwrap();
        source.process_signals();
        let records = source.get_all_records();

        let (mut target, _) = coordinator();
        let events = target.subscribe();
        assert_eq!(target.load_records(&records), 1);
        assert_eq!(target.load_records(&records), 1);
        assert_eq!(target.get_all_measurements(), records);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_events_reach_persistence() {
        use crate::config::{BackupConfig, PersistenceConfig};
        use crate::persistence::AnnotationPersistence;
        use crate::session::SessionMetadata;
        use markup_storage::MemoryStore;
        use std::time::Duration;

        let config = PersistenceConfig::default()
            .with_auto_save_interval(Duration::from_secs(3600))
            .with_backup(BackupConfig { enabled: false, ..BackupConfig::default() });
        let engine = AnnotationPersistence::with_backend(config, Arc::new(MemoryStore::new()));
        let session = engine.create_session(SessionMetadata::for_viewport("vp-1", "img-1"), None);

        let (mut coordinator, handles) = coordinator();
        let events = coordinator.subscribe();
        coordinator.activate_tool(ToolKind::Length).unwrap();
        let handle = &handles[&ToolKind::Length];
        let kept = handle.complete(capture(vec![p(0.0, 0.0), p(3.0, 4.0)])).unwrap();
        let dropped = handle.complete(capture(vec![p(0.0, 0.0), p(1.0, 1.0)])).unwrap();
        handle.modify(kept, capture(vec![p(0.0, 0.0), p(6.0, 8.0)])).unwrap();
        coordinator.process_signals();
        coordinator.remove_measurement(dropped);

        assert_eq!(engine.drain_events(&events), 4);
        assert!(engine.force_save().is_saved());

        let stored = engine.load_session(session.id).unwrap();
        assert_eq!(stored.records, coordinator.get_all_records());
        assert_eq!(stored.records[0].measurement().unwrap().value, 10.0);
    }
}
