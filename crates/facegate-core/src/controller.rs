use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use facegate_config::{ControllerSettings, ResolvedConfig};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::actuator::{ActuatorGateway, SerialConnector};
use crate::capture::{Camera, Frame, V4lCamera};
use crate::errors::{catch_panic, AppError, AppResult, Fault};
use crate::faces::{
    CascadeDetector, DlibEmbedder, EmbeddingModel, FaceDetector, FaceRegion, IdentityStore,
    VerificationResult, Verifier,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Uninitialized,
    CameraInit,
    DetectorInit,
    IdentityStoreLoad,
    ActuatorInit,
    Monitoring,
    Stopped,
    Failed,
}

impl ControllerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ControllerState::Uninitialized => "uninitialized",
            ControllerState::CameraInit => "camera_init",
            ControllerState::DetectorInit => "detector_init",
            ControllerState::IdentityStoreLoad => "identity_store_load",
            ControllerState::ActuatorInit => "actuator_init",
            ControllerState::Monitoring => "monitoring",
            ControllerState::Stopped => "stopped",
            ControllerState::Failed => "failed",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Factories for the hardware and model handles the controller supervises.
pub trait Collaborators {
    fn open_camera(&mut self) -> AppResult<Box<dyn Camera>>;
    fn load_detector(&mut self) -> AppResult<Box<dyn FaceDetector>>;
    fn load_embedder(&mut self) -> AppResult<Box<dyn EmbeddingModel>>;
    fn load_identities(&mut self) -> AppResult<IdentityStore>;
}

/// Production wiring: V4L2 camera, cascade detector, dlib embedder, JSON identity store.
pub struct DeviceCollaborators {
    config: ResolvedConfig,
}

impl DeviceCollaborators {
    pub fn new(config: ResolvedConfig) -> Self {
        Self { config }
    }
}

impl Collaborators for DeviceCollaborators {
    fn open_camera(&mut self) -> AppResult<Box<dyn Camera>> {
        Ok(Box::new(V4lCamera::open(&self.config.camera)?))
    }

    fn load_detector(&mut self) -> AppResult<Box<dyn FaceDetector>> {
        Ok(Box::new(CascadeDetector::load(&self.config.detector)?))
    }

    fn load_embedder(&mut self) -> AppResult<Box<dyn EmbeddingModel>> {
        Ok(Box::new(DlibEmbedder::load(&self.config.verifier)?))
    }

    fn load_identities(&mut self) -> AppResult<IdentityStore> {
        IdentityStore::load(&self.config.verifier.identity_store)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IterationOutcome {
    Authorized { name: String, dispatched: bool },
    Denied { result: VerificationResult },
    /// Shutdown was requested before a single face was seen.
    Interrupted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub started_at: String,
    pub stopped_at: String,
    pub iterations: u64,
    pub authorizations: u64,
    pub dispatch_failures: u64,
    pub denials: u64,
    pub faults: u64,
}

pub struct AccessController {
    settings: ControllerSettings,
    tolerance: f64,
    collaborators: Box<dyn Collaborators>,
    gateway: ActuatorGateway,
    shutdown: Arc<AtomicBool>,
    state: ControllerState,
    failed_phase: Option<&'static str>,
    camera: Option<Box<dyn Camera>>,
    detector: Option<Box<dyn FaceDetector>>,
    verifier: Option<Verifier>,
    identities: Option<IdentityStore>,
}

impl AccessController {
    pub fn new(
        settings: ControllerSettings,
        tolerance: f64,
        collaborators: Box<dyn Collaborators>,
        gateway: ActuatorGateway,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            settings,
            tolerance,
            collaborators,
            gateway,
            shutdown,
            state: ControllerState::Uninitialized,
            failed_phase: None,
            camera: None,
            detector: None,
            verifier: None,
            identities: None,
        }
    }

    pub fn from_config(config: &ResolvedConfig, shutdown: Arc<AtomicBool>) -> Self {
        let gateway = ActuatorGateway::new(Box::new(SerialConnector::new(&config.actuator)));
        Self::new(
            config.controller.clone(),
            config.verifier.tolerance,
            Box::new(DeviceCollaborators::new(config.clone())),
            gateway,
            shutdown,
        )
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn gateway(&self) -> &ActuatorGateway {
        &self.gateway
    }

    /// Acquire every collaborator under bounded retry.
    ///
    /// Camera, models and identity store escalate to [`Fault::Fatal`] once `max_attempts`
    /// consecutive attempts fail; the actuator channel does not, the gateway reconnects on
    /// first use instead.
    pub fn initialize(&mut self) -> Result<(), Fault> {
        match self.state {
            ControllerState::Failed => return Err(self.halted()),
            ControllerState::Monitoring => return Ok(()),
            _ => {}
        }

        self.transition(ControllerState::CameraInit);
        let settings = self.settings.clone();
        let collaborators = &mut self.collaborators;
        match with_retries(&settings, "camera", || collaborators.open_camera()) {
            Ok(camera) => self.camera = Some(camera),
            Err(err) => return Err(self.fail("camera", err)),
        }

        self.transition(ControllerState::DetectorInit);
        let collaborators = &mut self.collaborators;
        let models = with_retries(&settings, "detector", || {
            let detector = collaborators.load_detector()?;
            let embedder = collaborators.load_embedder()?;
            Ok((detector, embedder))
        });
        match models {
            Ok((detector, embedder)) => {
                self.detector = Some(detector);
                self.verifier = Some(Verifier::new(self.tolerance, embedder));
            }
            Err(err) => return Err(self.fail("detector", err)),
        }

        self.transition(ControllerState::IdentityStoreLoad);
        let collaborators = &mut self.collaborators;
        match with_retries(&settings, "identity store", || collaborators.load_identities()) {
            Ok(store) => {
                info!(
                    identities = store.len(),
                    dimension = store.dimension(),
                    path = %store.source().display(),
                    "loaded identity store"
                );
                self.identities = Some(store);
            }
            Err(err) => return Err(self.fail("identity store", err)),
        }

        self.transition(ControllerState::ActuatorInit);
        let gateway = &mut self.gateway;
        if let Err(err) = with_retries(&settings, "actuator", || gateway.connect()) {
            error!("actuator channel unavailable, continuing disconnected: {err}");
        }

        self.transition(ControllerState::Monitoring);
        Ok(())
    }

    /// One monitoring pass: wait for exactly one face, verify it, unlock on success.
    ///
    /// Capture, detection and verification faults abort the pass as [`Fault::Transient`].
    pub fn monitor_once(&mut self) -> Result<IterationOutcome, Fault> {
        match self.state {
            ControllerState::Monitoring => {}
            ControllerState::Failed => return Err(self.halted()),
            other => {
                return Err(Fault::Fatal(AppError::NotMonitoring {
                    state: other.as_str(),
                }))
            }
        }

        let (frame, region) = match self.await_single_face()? {
            Some(found) => found,
            None => return Ok(IterationOutcome::Interrupted),
        };

        let (Some(verifier), Some(identities)) = (self.verifier.as_ref(), self.identities.as_ref())
        else {
            return Err(Fault::Fatal(AppError::NotMonitoring {
                state: self.state.as_str(),
            }));
        };
        let result = catch_panic("verification", || {
            Ok(verifier.verify(&frame, &region, identities))
        })
        .map_err(Fault::Transient)?;

        match result {
            VerificationResult::Authorized(name) => {
                let dispatched = self.gateway.unlock();
                if dispatched {
                    info!(target: "audit", identity = %name, "door unlocked");
                } else {
                    error!(target: "audit", identity = %name, "authorized but unlock failed");
                }
                Ok(IterationOutcome::Authorized { name, dispatched })
            }
            result => {
                debug!(?result, "access denied");
                Ok(IterationOutcome::Denied { result })
            }
        }
    }

    /// Initialize, then monitor until shutdown is requested.
    pub fn run(&mut self) -> Result<RunSummary, Fault> {
        self.initialize()?;

        let mut summary = RunSummary {
            started_at: timestamp(),
            ..RunSummary::default()
        };
        info!("monitoring for faces");

        while !self.shutdown_requested() {
            match self.monitor_once() {
                Ok(IterationOutcome::Interrupted) => break,
                Ok(IterationOutcome::Authorized { dispatched, .. }) => {
                    summary.iterations += 1;
                    summary.authorizations += 1;
                    if !dispatched {
                        summary.dispatch_failures += 1;
                    }
                }
                Ok(IterationOutcome::Denied { .. }) => {
                    summary.iterations += 1;
                    summary.denials += 1;
                }
                Err(Fault::Transient(err)) => {
                    summary.faults += 1;
                    warn!("monitoring iteration aborted: {err}");
                    pause(self.settings.fault_backoff);
                }
                Err(fatal) => return Err(fatal),
            }
        }

        self.release();
        self.transition(ControllerState::Stopped);
        summary.stopped_at = timestamp();
        info!(
            iterations = summary.iterations,
            authorizations = summary.authorizations,
            faults = summary.faults,
            "access controller stopped"
        );
        Ok(summary)
    }

    fn await_single_face(&mut self) -> Result<Option<(Frame, FaceRegion)>, Fault> {
        let frame_interval = self.settings.frame_interval;
        let (Some(camera), Some(detector)) = (self.camera.as_mut(), self.detector.as_mut()) else {
            return Err(Fault::Fatal(AppError::NotMonitoring {
                state: self.state.as_str(),
            }));
        };

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let (frame, mut regions) = catch_panic("frame capture", || {
                let frame = camera.capture_frame()?;
                let regions = detector.detect(&frame)?;
                Ok((frame, regions))
            })
            .map_err(Fault::Transient)?;

            if regions.len() == 1 {
                let region = regions.remove(0);
                debug!(?region, "single face in view");
                return Ok(Some((frame, region)));
            }
            trace!(faces = regions.len(), "waiting for exactly one face");
            pause(frame_interval);
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn transition(&mut self, next: ControllerState) {
        debug!(from = %self.state, to = %next, "controller state change");
        self.state = next;
    }

    fn fail(&mut self, phase: &'static str, err: AppError) -> Fault {
        error!(
            target: "audit",
            severity = "critical",
            phase,
            attempts = self.settings.max_attempts,
            "initialization failed: {err}"
        );
        self.release();
        self.failed_phase = Some(phase);
        self.transition(ControllerState::Failed);
        Fault::Fatal(err)
    }

    fn halted(&self) -> Fault {
        Fault::Fatal(AppError::ControllerFailed {
            phase: self.failed_phase.unwrap_or("initialization"),
        })
    }

    fn release(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            camera.close();
        }
        self.detector = None;
        self.verifier = None;
        self.identities = None;
        self.gateway.close();
    }
}

impl Drop for AccessController {
    fn drop(&mut self) {
        self.release();
    }
}

fn with_retries<T>(
    settings: &ControllerSettings,
    phase: &'static str,
    mut attempt: impl FnMut() -> AppResult<T>,
) -> AppResult<T> {
    let max_attempts = settings.max_attempts.max(1);
    let mut tries = 0;
    loop {
        tries += 1;
        match catch_panic(phase, &mut attempt) {
            Ok(value) => {
                debug!(phase, attempt = tries, "initialized");
                return Ok(value);
            }
            Err(err) if tries < max_attempts => {
                warn!(phase, attempt = tries, max_attempts, "initialization failed: {err}");
                pause(settings.init_retry_delay);
            }
            Err(err) => return Err(err),
        }
    }
}

fn pause(duration: Duration) {
    if duration > Duration::ZERO {
        sleep(duration);
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
