//! Test doubles shared by worker, registry and pipeline tests

use crate::capture_source::{CaptureSource, Frame, SourceDescriptor, SourceOpener};
use crate::classifier::Classifier;
use crate::error::{Error, Result};
use crate::geometry::Point;
use crate::models::{CameraId, RawDetection, Slot, SlotId, SlotStatus};
use crate::realtime_hub::{EventPublisher, SlotUpdate, WorkerStatusMessage};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Raw detection labelled "car"
pub fn car_at(x: f64, y: f64, w: f64, h: f64) -> RawDetection {
    RawDetection {
        bbox: vec![x, y, w, h],
        confidence: 0.9,
        class_name: "car".to_string(),
    }
}

/// Axis-aligned square slot
pub fn square_slot(id: SlotId, camera_id: i64, x: f64, y: f64, size: f64) -> Slot {
    Slot {
        id,
        camera_id,
        label: format!("S{}", id),
        polygon: vec![
            Point::new(x, y),
            Point::new(x + size, y),
            Point::new(x + size, y + size),
            Point::new(x, y + size),
        ],
        status: SlotStatus::Empty,
        last_changed_at: Utc::now(),
    }
}

#[derive(Clone, Copy)]
enum ReadMode {
    Endless,
    AlwaysFail,
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    reads: AtomicUsize,
    releases: AtomicUsize,
}

/// Opener producing scripted sources
pub struct ScriptedOpener {
    fail_open: bool,
    mode: ReadMode,
    fps: Option<f64>,
    open_delay: Option<Duration>,
    counters: Arc<Counters>,
}

impl ScriptedOpener {
    /// Frames forever at a high frame rate
    pub fn endless() -> Self {
        Self::build(false, ReadMode::Endless)
    }

    /// Opens, then every read fails
    pub fn failing_reads() -> Self {
        Self::build(false, ReadMode::AlwaysFail)
    }

    /// Open itself fails
    pub fn failing_open() -> Self {
        Self::build(true, ReadMode::AlwaysFail)
    }

    fn build(fail_open: bool, mode: ReadMode) -> Self {
        Self {
            fail_open,
            mode,
            fps: Some(500.0),
            open_delay: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Block inside `open` before returning, like a slow network probe
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.counters.reads.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }
}

impl SourceOpener for ScriptedOpener {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn CaptureSource>> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }
        if self.fail_open {
            return Err(Error::Capture(format!("cannot open {}", descriptor)));
        }
        Ok(Box::new(ScriptedSource {
            mode: self.mode,
            fps: self.fps,
            counters: Arc::clone(&self.counters),
            released: false,
        }))
    }
}

struct ScriptedSource {
    mode: ReadMode,
    fps: Option<f64>,
    counters: Arc<Counters>,
    released: bool,
}

impl CaptureSource for ScriptedSource {
    fn read(&mut self) -> Result<Frame> {
        let n = self.counters.reads.fetch_add(1, Ordering::SeqCst);
        if self.released {
            return Err(Error::Capture("released".to_string()));
        }
        match self.mode {
            ReadMode::Endless => {
                Ok(Frame::from_bytes(vec![0xFF, 0xD8, (n % 256) as u8, 0xFF, 0xD9]))
            }
            ReadMode::AlwaysFail => Err(Error::Capture("no signal".to_string())),
        }
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Classifier returning a fixed answer
pub struct ScriptedClassifier {
    detections: Vec<RawDetection>,
    fail: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn returning(detections: Vec<RawDetection>) -> Self {
        Self {
            detections,
            fail: false,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::returning(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Classifier for ScriptedClassifier {
    fn infer(&self, _frame: Frame) -> BoxFuture<'_, Result<Vec<RawDetection>>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(Error::Inference("detector unavailable".to_string()));
            }
            Ok(self.detections.clone())
        }
        .boxed()
    }
}

/// Publisher that records what it was asked to send
#[derive(Default)]
pub struct RecordingPublisher {
    updates: Mutex<Vec<SlotUpdate>>,
    worker_notices: Mutex<Vec<CameraId>>,
    fail: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<SlotUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn worker_notices(&self) -> Vec<CameraId> {
        self.worker_notices.lock().unwrap().clone()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, update: SlotUpdate) -> BoxFuture<'_, Result<()>> {
        async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Publish("no subscribers reachable".to_string()));
            }
            self.updates.lock().unwrap().push(update);
            Ok(())
        }
        .boxed()
    }

    fn notify_worker(&self, status: WorkerStatusMessage) -> BoxFuture<'_, Result<()>> {
        async move {
            self.worker_notices.lock().unwrap().push(status.camera_id);
            Ok(())
        }
        .boxed()
    }
}
