use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::rc::Rc;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use facegate_config::ControllerSettings;
use facegate_core::actuator::{ActuatorChannel, ActuatorGateway, ChannelConnector, UNLOCK_COMMAND};
use facegate_core::capture::{Camera, ChannelOrder, Frame};
use facegate_core::controller::{AccessController, Collaborators, ControllerState};
use facegate_core::errors::{AppError, AppResult};
use facegate_core::faces::{EmbeddingModel, FaceDetector, FaceRegion, IdentityStore};
use image::RgbImage;
use tempfile::TempDir;

/// What the fake detector reports for one captured frame.
enum Step {
    Faces(usize),
    Fail,
    Panic,
    PanicWith(&'static str),
}

struct World {
    steps: VecDeque<Step>,
    shutdown: Arc<AtomicBool>,
    store_path: std::path::PathBuf,
    frames: u32,
    faces_at_verify: Vec<usize>,
    last_faces: usize,
    writes: Vec<Vec<u8>>,
    failed_sends: u32,
    connects: u32,
    failed_reconnects: u32,
    store_loads: u32,
}

type Shared = Rc<RefCell<World>>;

struct ScriptedCamera(Shared);

impl Camera for ScriptedCamera {
    fn capture_frame(&mut self) -> AppResult<Frame> {
        let mut world = self.0.borrow_mut();
        world.frames += 1;
        Ok(Frame::new(40, 30, ChannelOrder::Bgr, vec![90; 40 * 30 * 3]))
    }

    fn close(&mut self) {}
}

struct ScriptedDetector(Shared);

impl FaceDetector for ScriptedDetector {
    fn detect(&mut self, frame: &Frame) -> AppResult<Vec<FaceRegion>> {
        frame.validate()?;
        let step = {
            let mut world = self.0.borrow_mut();
            let step = world.steps.pop_front();
            if world.steps.is_empty() {
                world.shutdown.store(true, Ordering::SeqCst);
            }
            step
        };
        match step {
            Some(Step::Faces(count)) => {
                self.0.borrow_mut().last_faces = count;
                Ok((0..count)
                    .map(|idx| FaceRegion::new(idx as i64 * 10, 2, 12, 12))
                    .collect())
            }
            Some(Step::Fail) => Err(AppError::FrameProcessing("sensor glitch".into())),
            Some(Step::Panic) => panic!("binding blew up"),
            Some(Step::PanicWith(message)) => panic!("{}", message),
            None => Ok(Vec::new()),
        }
    }
}

struct RecordingEmbedder(Shared);

impl EmbeddingModel for RecordingEmbedder {
    fn embed(&self, _face: &RgbImage) -> AppResult<Option<Vec<f64>>> {
        let mut world = self.0.borrow_mut();
        let faces = world.last_faces;
        world.faces_at_verify.push(faces);
        Ok(Some(vec![0.0, 0.1]))
    }
}

struct WorldCollaborators(Shared);

impl Collaborators for WorldCollaborators {
    fn open_camera(&mut self) -> AppResult<Box<dyn Camera>> {
        Ok(Box::new(ScriptedCamera(Rc::clone(&self.0))))
    }

    fn load_detector(&mut self) -> AppResult<Box<dyn FaceDetector>> {
        Ok(Box::new(ScriptedDetector(Rc::clone(&self.0))))
    }

    fn load_embedder(&mut self) -> AppResult<Box<dyn EmbeddingModel>> {
        Ok(Box::new(RecordingEmbedder(Rc::clone(&self.0))))
    }

    fn load_identities(&mut self) -> AppResult<IdentityStore> {
        let path = {
            let mut world = self.0.borrow_mut();
            world.store_loads += 1;
            world.store_path.clone()
        };
        IdentityStore::load(&path)
    }
}

struct WireChannel(Shared);

impl ActuatorChannel for WireChannel {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut world = self.0.borrow_mut();
        if world.failed_sends > 0 {
            world.failed_sends -= 1;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "lock unplugged"));
        }
        world.writes.push(bytes.to_vec());
        Ok(())
    }
}

struct WireConnector(Shared);

impl ChannelConnector for WireConnector {
    fn describe(&self) -> String {
        "wire".into()
    }

    fn connect(&self) -> AppResult<Box<dyn ActuatorChannel>> {
        {
            let mut world = self.0.borrow_mut();
            // The connection made during initialization always succeeds.
            if world.connects > 0 && world.failed_reconnects > 0 {
                world.failed_reconnects -= 1;
                return Err(AppError::FrameProcessing("serial port busy".into()));
            }
            world.connects += 1;
        }
        Ok(Box::new(WireChannel(Rc::clone(&self.0))))
    }
}

fn build(tmp: &TempDir, store_json: &str, steps: Vec<Step>) -> (AccessController, Shared) {
    let store_path = tmp.path().join("authorized_faces.json");
    fs::write(&store_path, store_json).unwrap();

    let shutdown = Arc::new(AtomicBool::new(false));
    let world = Rc::new(RefCell::new(World {
        steps: steps.into(),
        shutdown: Arc::clone(&shutdown),
        store_path,
        frames: 0,
        faces_at_verify: Vec::new(),
        last_faces: 0,
        writes: Vec::new(),
        failed_sends: 0,
        connects: 0,
        failed_reconnects: 0,
        store_loads: 0,
    }));

    let settings = ControllerSettings {
        max_attempts: 3,
        init_retry_delay: Duration::ZERO,
        frame_interval: Duration::ZERO,
        fault_backoff: Duration::ZERO,
    };
    let controller = AccessController::new(
        settings,
        0.5,
        Box::new(WorldCollaborators(Rc::clone(&world))),
        ActuatorGateway::new(Box::new(WireConnector(Rc::clone(&world)))),
        shutdown,
    );
    (controller, world)
}

const ALICE: &str = r#"{"alice": [0.0, 0.0]}"#;

#[test]
fn verifier_only_sees_single_face_frames() {
    let tmp = TempDir::new().unwrap();
    let steps = vec![
        Step::Faces(0),
        Step::Faces(2),
        Step::Faces(1),
        Step::Faces(3),
        Step::Faces(0),
        Step::Faces(1),
        Step::Faces(5),
        Step::Faces(1),
        Step::Faces(0),
    ];
    let (mut controller, world) = build(&tmp, ALICE, steps);

    let summary = controller.run().unwrap();
    assert_eq!(controller.state(), ControllerState::Stopped);

    let world = world.borrow();
    assert_eq!(world.frames, 9);
    assert_eq!(world.faces_at_verify, vec![1, 1, 1]);
    assert_eq!(summary.authorizations, 3);
    assert_eq!(summary.iterations, 3);
}

#[test]
fn consecutive_authorizations_each_dispatch_unlock() {
    let tmp = TempDir::new().unwrap();
    let (mut controller, world) = build(
        &tmp,
        ALICE,
        vec![Step::Faces(1), Step::Faces(1), Step::Faces(0)],
    );

    let summary = controller.run().unwrap();
    assert_eq!(summary.authorizations, 2);
    assert_eq!(summary.dispatch_failures, 0);
    assert_eq!(
        world.borrow().writes,
        vec![UNLOCK_COMMAND.to_vec(), UNLOCK_COMMAND.to_vec()]
    );
}

#[test]
fn failed_unlock_dispatch_does_not_stop_monitoring() {
    let tmp = TempDir::new().unwrap();
    let (mut controller, world) = build(
        &tmp,
        ALICE,
        vec![Step::Faces(1), Step::Faces(1), Step::Faces(0)],
    );
    {
        let mut world = world.borrow_mut();
        world.failed_sends = 1;
        world.failed_reconnects = 1;
    }

    let summary = controller.run().unwrap();
    assert_eq!(controller.state(), ControllerState::Stopped);
    assert_eq!(summary.authorizations, 2);
    assert_eq!(summary.dispatch_failures, 1);
    assert_eq!(summary.faults, 0);

    let world = world.borrow();
    assert_eq!(world.faces_at_verify, vec![1, 1]);
    assert_eq!(world.writes, vec![UNLOCK_COMMAND.to_vec()]);
    assert_eq!(world.connects, 2);
}

#[test]
fn monitoring_survives_errors_and_panics() {
    let tmp = TempDir::new().unwrap();
    let (mut controller, world) = build(
        &tmp,
        ALICE,
        vec![
            Step::Fail,
            Step::Panic,
            Step::Fail,
            Step::Faces(1),
            Step::Faces(0),
        ],
    );

    let summary = controller.run().unwrap();
    assert_eq!(summary.faults, 3);
    assert_eq!(summary.authorizations, 1);
    assert_eq!(world.borrow().writes.len(), 1);
}

#[test]
fn unknown_face_is_denied_without_unlock() {
    let tmp = TempDir::new().unwrap();
    let (mut controller, world) = build(
        &tmp,
        r#"{"mallory": [5.0, 5.0]}"#,
        vec![Step::Faces(1), Step::Faces(0)],
    );

    let summary = controller.run().unwrap();
    assert_eq!(summary.denials, 1);
    assert_eq!(summary.authorizations, 0);
    assert!(world.borrow().writes.is_empty());
}

#[test]
fn empty_identity_store_is_fatal_after_bounded_retries() {
    let tmp = TempDir::new().unwrap();
    let (mut controller, world) = build(&tmp, "{}", vec![Step::Faces(1)]);

    let fault = controller.run().unwrap_err();
    assert!(fault.is_fatal());
    assert!(matches!(
        fault.into_error(),
        AppError::EmptyIdentityStore { .. }
    ));
    assert_eq!(controller.state(), ControllerState::Failed);
    assert_eq!(world.borrow().store_loads, 3);
    assert_eq!(world.borrow().frames, 0);

    assert!(controller.initialize().unwrap_err().is_fatal());
    assert_eq!(world.borrow().store_loads, 3);
}

#[test]
fn monitoring_panics_still_reach_the_panic_hook() {
    static REPORTED: AtomicUsize = AtomicUsize::new(0);
    const MARKER: &str = "detector lost its cascade";

    let previous = panic::take_hook();
    panic::set_hook(Box::new(|info| {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| payload.downcast_ref::<&str>().copied());
        if message == Some(MARKER) {
            REPORTED.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let tmp = TempDir::new().unwrap();
    let (mut controller, _world) = build(
        &tmp,
        ALICE,
        vec![Step::PanicWith(MARKER), Step::Faces(1), Step::Faces(0)],
    );
    let summary = controller.run();
    panic::set_hook(previous);

    let summary = summary.unwrap();
    assert_eq!(summary.faults, 1);
    assert_eq!(summary.authorizations, 1);
    assert_eq!(REPORTED.load(Ordering::SeqCst), 1);
}
