//! Heart-rate capture behind one interface with two backends.
//!
//! A paired device is reached through the [`DeviceLink`] capability and
//! streams measurement frames; without a link the sensor falls back to a
//! seeded random walk. Readings are pushed to registered callbacks and are
//! not persisted here. A link reports a revoked permission through the same
//! callback; the owner polls [`HeartRateSensor::health`] to observe it.

use crate::config::HeartRateConfig;
use crate::{Error, HeartRateSample, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Callback invoked for every decoded reading
pub type ReadingCallback = Arc<dyn Fn(&HeartRateSample) + Send + Sync>;

/// Callback receiving raw notification frames, or the error that ended the
/// subscription, from a device
pub type FrameCallback = Box<dyn Fn(Result<&[u8]>) + Send + Sync>;

/// Platform device-pairing capability
pub trait DeviceLink: Send {
    /// Find a device advertising `service_id`; returns its identifier
    fn discover(&mut self, service_id: &str) -> Result<Option<String>>;

    fn connect(&mut self, device_id: &str) -> Result<()>;

    /// Start measurement notifications; permission loss or a dropped
    /// device is delivered to `on_frame` as an error
    fn subscribe(&mut self, on_frame: FrameCallback) -> Result<()>;

    /// Release the subscription and connection; safe to call repeatedly
    fn disconnect(&mut self);
}

// ============================================================================
// Frame decoding
// ============================================================================

const FLAG_BPM_U16: u8 = 0x01;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_ENERGY: u8 = 0x08;
const FLAG_RR: u8 = 0x10;

fn read_u16(frame: &[u8], at: usize, field: &str) -> Result<u16> {
    match frame.get(at..at + 2) {
        Some(bytes) => Ok(u16::from_le_bytes([bytes[0], bytes[1]])),
        None => Err(Error::Frame(format!("truncated {} at byte {}", field, at))),
    }
}

/// Decode a heart-rate measurement frame
///
/// Byte 0 holds flags; the BPM field is 8 or 16 bits, followed by optional
/// energy expended (u16) and R-R intervals (u16 each, 1/1024 s), all
/// little-endian.
pub fn parse_frame(frame: &[u8], timestamp: DateTime<Utc>) -> Result<HeartRateSample> {
    let flags = *frame
        .first()
        .ok_or_else(|| Error::Frame("empty frame".into()))?;
    let mut at = 1;

    let bpm = if flags & FLAG_BPM_U16 != 0 {
        let bpm = read_u16(frame, at, "bpm")?;
        at += 2;
        bpm
    } else {
        let bpm = *frame
            .get(at)
            .ok_or_else(|| Error::Frame("truncated bpm at byte 1".into()))?;
        at += 1;
        u16::from(bpm)
    };

    let sensor_contact = if flags & FLAG_CONTACT_SUPPORTED != 0 {
        Some(flags & FLAG_CONTACT_DETECTED != 0)
    } else {
        None
    };

    let energy_expended_kj = if flags & FLAG_ENERGY != 0 {
        let energy = read_u16(frame, at, "energy")?;
        at += 2;
        Some(energy)
    } else {
        None
    };

    let mut rr_intervals_ms = Vec::new();
    if flags & FLAG_RR != 0 {
        let rest = &frame[at.min(frame.len())..];
        if rest.len() % 2 != 0 {
            return Err(Error::Frame(format!(
                "odd R-R interval payload of {} bytes",
                rest.len()
            )));
        }
        rr_intervals_ms = rest
            .chunks_exact(2)
            .map(|pair| f64::from(u16::from_le_bytes([pair[0], pair[1]])) * 1000.0 / 1024.0)
            .collect();
    }

    Ok(HeartRateSample {
        bpm,
        sensor_contact,
        energy_expended_kj,
        rr_intervals_ms,
        timestamp,
    })
}

// ============================================================================
// Simulation
// ============================================================================

/// Bounded random walk around a resting baseline
pub struct SimulatedHeartRate {
    rng: StdRng,
    current: f64,
    config: HeartRateConfig,
}

impl SimulatedHeartRate {
    pub fn new(config: HeartRateConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            current: f64::from(config.baseline_bpm),
            config,
        }
    }

    /// Advance the walk one step
    pub fn next_sample(&mut self) -> HeartRateSample {
        let step = i32::from(self.config.max_step_bpm);
        let jitter = f64::from(self.rng.gen_range(-step..=step));
        // Mean reversion toward the baseline
        let pull = (f64::from(self.config.baseline_bpm) - self.current) * 0.1;
        self.current = (self.current + jitter + pull).clamp(
            f64::from(self.config.min_bpm),
            f64::from(self.config.max_bpm),
        );

        let bpm = self.current.round() as u16;
        HeartRateSample {
            bpm,
            sensor_contact: Some(true),
            energy_expended_kj: None,
            rr_intervals_ms: vec![60_000.0 / f64::from(bpm.max(1))],
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Sensor
// ============================================================================

#[derive(Default)]
struct Dispatcher {
    callbacks: Mutex<Vec<ReadingCallback>>,
    latest: Mutex<Option<HeartRateSample>>,
    /// Set once the device reports that permission was revoked
    revoked: Mutex<Option<String>>,
}

impl Dispatcher {
    fn device_event(&self, event: Result<&[u8]>) {
        match event {
            Ok(frame) => match parse_frame(frame, Utc::now()) {
                Ok(sample) => {
                    if !self.is_revoked() {
                        self.dispatch(sample);
                    }
                }
                Err(e) => tracing::warn!("Dropping heart-rate frame: {}", e),
            },
            Err(Error::SensorPermissionDenied(reason)) => {
                tracing::warn!("Heart-rate permission revoked: {}", reason);
                if let Ok(mut revoked) = self.revoked.lock() {
                    revoked.get_or_insert(reason);
                }
            }
            Err(e) => tracing::warn!("Heart-rate device error: {}", e),
        }
    }

    fn is_revoked(&self) -> bool {
        self.revoked.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    fn dispatch(&self, sample: HeartRateSample) {
        let callbacks = match self.callbacks.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        for callback in &callbacks {
            callback(&sample);
        }
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(sample);
        }
    }
}

enum Backend {
    Disconnected,
    Device,
    Simulated {
        stop: Sender<()>,
        worker: JoinHandle<()>,
    },
}

/// Heart-rate sensor owned by a session
pub struct HeartRateSensor {
    config: HeartRateConfig,
    link: Option<Box<dyn DeviceLink>>,
    backend: Backend,
    dispatcher: Arc<Dispatcher>,
    sim_interval: Duration,
}

impl HeartRateSensor {
    /// `link` is `None` on platforms without a device-pairing capability
    pub fn new(config: HeartRateConfig, link: Option<Box<dyn DeviceLink>>) -> Self {
        Self {
            config,
            link,
            backend: Backend::Disconnected,
            dispatcher: Arc::new(Dispatcher::default()),
            sim_interval: Duration::from_secs(1),
        }
    }

    /// Override the simulated emission interval (one second by default)
    pub fn with_simulation_interval(mut self, interval: Duration) -> Self {
        self.sim_interval = interval;
        self
    }

    /// Connect to a paired device, or fall back to simulation when the
    /// platform has no pairing capability
    ///
    /// Returns `Ok(false)` when a capability exists but no device could be
    /// reached. Permission errors are returned as-is.
    pub fn connect(&mut self) -> Result<bool> {
        if self.is_connected() {
            return Ok(true);
        }
        let Some(link) = self.link.as_mut() else {
            tracing::info!("No device-pairing capability, using simulated heart rate");
            self.start_simulation();
            return Ok(true);
        };

        let device_id = match link.discover(&self.config.service_id) {
            Ok(Some(id)) => id,
            Ok(None) => {
                tracing::warn!("No heart-rate device found for {}", self.config.service_id);
                return Ok(false);
            }
            Err(e @ Error::SensorPermissionDenied(_)) => return Err(e),
            Err(e) => {
                tracing::warn!("Heart-rate discovery failed: {}", e);
                return Ok(false);
            }
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        let on_frame: FrameCallback =
            Box::new(move |event: Result<&[u8]>| dispatcher.device_event(event));

        let linked = link.connect(&device_id).and_then(|_| link.subscribe(on_frame));
        match linked {
            Ok(()) => {
                tracing::info!("Connected to heart-rate device {}", device_id);
                self.backend = Backend::Device;
                Ok(true)
            }
            Err(e) => {
                link.disconnect();
                match e {
                    Error::SensorPermissionDenied(_) => Err(e),
                    other => {
                        tracing::warn!("Heart-rate device {} unavailable: {}", device_id, other);
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Emit simulated readings on a worker thread, replacing any device
    pub fn start_simulation(&mut self) {
        self.disconnect();

        let (stop, stopped) = channel::<()>();
        let dispatcher = Arc::clone(&self.dispatcher);
        let interval = self.sim_interval;
        let mut walk = SimulatedHeartRate::new(self.config.clone());

        let worker = std::thread::spawn(move || loop {
            dispatcher.dispatch(walk.next_sample());
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        });
        self.backend = Backend::Simulated { stop, worker };
    }

    /// Register a callback for every reading
    pub fn on_reading(&self, callback: impl Fn(&HeartRateSample) + Send + Sync + 'static) {
        if let Ok(mut callbacks) = self.dispatcher.callbacks.lock() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// Release the device subscription or simulation timer
    pub fn disconnect(&mut self) {
        match std::mem::replace(&mut self.backend, Backend::Disconnected) {
            Backend::Disconnected => {}
            Backend::Device => {
                if let Some(link) = self.link.as_mut() {
                    link.disconnect();
                }
                tracing::info!("Disconnected heart-rate device");
            }
            Backend::Simulated { stop, worker } => {
                drop(stop);
                if worker.join().is_err() {
                    tracing::warn!("Heart-rate simulation worker panicked");
                }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.backend, Backend::Disconnected)
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self.backend, Backend::Simulated { .. })
    }

    /// `Err(SensorPermissionDenied)` once the device reported that
    /// permission was revoked
    pub fn health(&self) -> Result<()> {
        match self.dispatcher.revoked.lock() {
            Ok(revoked) => match revoked.as_ref() {
                Some(reason) => Err(Error::SensorPermissionDenied(reason.clone())),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }

    /// Most recent reading from either backend
    pub fn latest(&self) -> Option<HeartRateSample> {
        self.dispatcher.latest.lock().ok().and_then(|l| l.clone())
    }
}

impl Drop for HeartRateSensor {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Device link recording calls and exposing the frame callback
    #[derive(Clone, Default)]
    struct FakeLink {
        device: Option<String>,
        deny: bool,
        on_frame: Arc<Mutex<Option<FrameCallback>>>,
        disconnects: Arc<AtomicUsize>,
    }

    impl FakeLink {
        fn emit(&self, frame: &[u8]) {
            if let Some(cb) = self.on_frame.lock().unwrap().as_ref() {
                cb(Ok(frame));
            }
        }

        fn report(&self, error: Error) {
            if let Some(cb) = self.on_frame.lock().unwrap().as_ref() {
                cb(Err(error));
            }
        }
    }

    impl DeviceLink for FakeLink {
        fn discover(&mut self, _service_id: &str) -> Result<Option<String>> {
            if self.deny {
                return Err(Error::SensorPermissionDenied("bluetooth".into()));
            }
            Ok(self.device.clone())
        }

        fn connect(&mut self, _device_id: &str) -> Result<()> {
            Ok(())
        }

        fn subscribe(&mut self, on_frame: FrameCallback) -> Result<()> {
            *self.on_frame.lock().unwrap() = Some(on_frame);
            Ok(())
        }

        fn disconnect(&mut self) {
            self.on_frame.lock().unwrap().take();
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_parse_8bit_frame_without_contact() {
        let sample = parse_frame(&[0x00, 72], Utc::now()).unwrap();
        assert_eq!(sample.bpm, 72);
        assert_eq!(sample.sensor_contact, None);
        assert_eq!(sample.energy_expended_kj, None);
        assert!(sample.rr_intervals_ms.is_empty());
    }

    #[test]
    fn test_parse_full_frame() {
        // 16-bit bpm, contact supported+detected, energy, two R-R values
        let frame = [0x1F, 0x2C, 0x01, 0x10, 0x00, 0x00, 0x04, 0x00, 0x02];
        let sample = parse_frame(&frame, Utc::now()).unwrap();
        assert_eq!(sample.bpm, 300);
        assert_eq!(sample.sensor_contact, Some(true));
        assert_eq!(sample.energy_expended_kj, Some(16));
        assert_eq!(sample.rr_intervals_ms, vec![1000.0, 500.0]);
    }

    #[test]
    fn test_parse_contact_supported_but_lost() {
        let sample = parse_frame(&[0x04, 60], Utc::now()).unwrap();
        assert_eq!(sample.sensor_contact, Some(false));
    }

    #[test]
    fn test_parse_truncated_frames() {
        assert!(matches!(parse_frame(&[], Utc::now()), Err(Error::Frame(_))));
        assert!(parse_frame(&[0x01, 0x2C], Utc::now()).is_err());
        assert!(parse_frame(&[0x08, 70, 0x01], Utc::now()).is_err());
        assert!(parse_frame(&[0x10, 70, 0x00, 0x04, 0x00], Utc::now()).is_err());
    }

    #[test]
    fn test_simulation_is_seeded_and_bounded() {
        let config = HeartRateConfig {
            seed: 7,
            ..HeartRateConfig::default()
        };
        let mut a = SimulatedHeartRate::new(config.clone());
        let mut b = SimulatedHeartRate::new(config.clone());

        let mut previous = config.baseline_bpm;
        for _ in 0..500 {
            let sa = a.next_sample();
            let sb = b.next_sample();
            assert_eq!(sa.bpm, sb.bpm);
            assert!((config.min_bpm..=config.max_bpm).contains(&sa.bpm));
            assert!((i32::from(sa.bpm) - i32::from(previous)).abs() <= 7);
            previous = sa.bpm;
        }
    }

    #[test]
    fn test_no_capability_falls_back_to_simulation() {
        let mut sensor = HeartRateSensor::new(HeartRateConfig::default(), None)
            .with_simulation_interval(Duration::from_millis(5));
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        sensor.on_reading(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(sensor.connect().unwrap());
        assert!(sensor.is_connected());
        assert!(sensor.is_simulated());

        std::thread::sleep(Duration::from_millis(60));
        sensor.disconnect();
        let after_disconnect = count.load(Ordering::SeqCst);
        assert!(after_disconnect >= 1);
        assert!(sensor.latest().is_some());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after_disconnect);
        assert!(!sensor.is_connected());

        // Idempotent
        sensor.disconnect();
    }

    #[test]
    fn test_device_frames_reach_callbacks() {
        let link = FakeLink {
            device: Some("hrm-1".into()),
            ..FakeLink::default()
        };
        let handle = link.clone();
        let mut sensor = HeartRateSensor::new(HeartRateConfig::default(), Some(Box::new(link)));
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        sensor.on_reading(move |s| sink.lock().unwrap().push(s.bpm));

        assert!(sensor.connect().unwrap());
        assert!(!sensor.is_simulated());

        handle.emit(&[0x00, 95]);
        handle.emit(&[0x01]); // malformed, dropped
        handle.emit(&[0x00, 97]);
        assert_eq!(*received.lock().unwrap(), vec![95, 97]);
        assert_eq!(sensor.latest().unwrap().bpm, 97);

        sensor.disconnect();
        sensor.disconnect();
        assert_eq!(handle.disconnects.load(Ordering::SeqCst), 1);
        assert!(!sensor.is_connected());
    }

    #[test]
    fn test_missing_device_reports_false() {
        let mut sensor =
            HeartRateSensor::new(HeartRateConfig::default(), Some(Box::new(FakeLink::default())));
        assert!(!sensor.connect().unwrap());
        assert!(!sensor.is_connected());
    }

    #[test]
    fn test_permission_denied_propagates() {
        let link = FakeLink {
            deny: true,
            ..FakeLink::default()
        };
        let mut sensor = HeartRateSensor::new(HeartRateConfig::default(), Some(Box::new(link)));
        assert!(matches!(sensor.connect(), Err(Error::SensorPermissionDenied(_))));
    }

    #[test]
    fn test_revoked_permission_is_reported_by_health() {
        let link = FakeLink {
            device: Some("hrm-1".into()),
            ..FakeLink::default()
        };
        let handle = link.clone();
        let mut sensor = HeartRateSensor::new(HeartRateConfig::default(), Some(Box::new(link)));
        assert!(sensor.connect().unwrap());

        handle.emit(&[0x00, 88]);
        handle.report(Error::SensorUnavailable("signal lost".into()));
        assert!(sensor.health().is_ok());

        handle.report(Error::SensorPermissionDenied("bluetooth".into()));
        assert!(matches!(sensor.health(), Err(Error::SensorPermissionDenied(_))));

        // Frames after the revocation are not dispatched
        handle.emit(&[0x00, 140]);
        assert_eq!(sensor.latest().unwrap().bpm, 88);
    }
}
