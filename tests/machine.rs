mod common;

use apa_winder::calibration::PinId;
use apa_winder::file_manager::FileManager;
use apa_winder::gcode::HandlerState;
use apa_winder::geometry::{FaceSide, Location};
use apa_winder::machine::{Machine, MachineError};
use apa_winder::motion::MotionQueue;
use apa_winder::plc::{PlcDriver, PlcLogic, PlcStatusHandle};
use apa_winder::process::{ApaStage, ApaStore};
use apa_winder::simulator::SimulatedPlc;
use apa_winder::web::UiCommand;
use apa_winder::Mode;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const RECIPE: &str = "ten.gc";
const MAX_CYCLES: usize = 400;

/// A machine wired to a simulated PLC, stepped by hand: one PLC poll then
/// one control tick per cycle.
struct Rig {
    plc: SimulatedPlc,
    driver: PlcDriver,
    machine: Machine,
}

impl Rig {
    async fn new(root: &Path, plc: SimulatedPlc) -> Self {
        Self::with_move_timeout(root, plc, common::config(root).machine.move_timeout()).await
    }

    async fn with_move_timeout(root: &Path, plc: SimulatedPlc, move_timeout: Duration) -> Self {
        let config = common::config(root);
        let queue = MotionQueue::new(config.machine.queue_capacity);
        let status = PlcStatusHandle::new();
        let logic = PlcLogic::new(Arc::new(plc.clone()), Duration::from_millis(50));
        let mut driver = PlcDriver::new(logic, queue.clone(), status.clone(), config.machine.io_period())
            .with_move_timeout(move_timeout);
        driver.cycle().await;

        let mut machine = Machine::new(&config, FileManager::new(root), queue, status).unwrap();
        machine.boot().unwrap();
        Self { plc, driver, machine }
    }

    async fn cycle(&mut self) {
        self.driver.cycle().await;
        self.machine.tick().unwrap();
    }

    async fn run_until(&mut self, done: impl Fn(&Machine) -> bool) {
        for _ in 0..MAX_CYCLES {
            if done(&self.machine) {
                return;
            }
            self.cycle().await;
        }
        panic!("gave up after {} cycles: {:?}", MAX_CYCLES, self.machine);
    }

    fn send(&mut self, command: UiCommand) -> String {
        self.machine.handle(command).unwrap()
    }

    fn load(&mut self) {
        let reply = self.send(UiCommand::Load { recipe: RECIPE.to_string(), line: None });
        assert_eq!(reply, "ok X 10 lines");
    }

    fn wound(&self) -> f64 {
        self.machine.apa().wound_length(common::LAYER)
    }
}

fn finished(machine: &Machine) -> bool {
    machine.mode() == Mode::Stop && machine.handler().session().is_none()
}

fn stopped(machine: &Machine) -> bool {
    machine.mode() == Mode::Stop
}

fn assert_close(actual: f64, expected: f64) {
    assert!((actual - expected).abs() < 1e-6, "expected {}, got {}", expected, actual);
}

#[tokio::test]
async fn test_stop_keeps_line_and_wound_length_in_step() {
    let dir = tempdir().unwrap();
    common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let mut rig = Rig::new(dir.path(), SimulatedPlc::new(1)).await;
    rig.load();

    assert_eq!(rig.send(UiCommand::Start), "ok");
    rig.run_until(|m| m.handler().committed_line() >= Some(3)).await;
    assert_eq!(rig.machine.mode(), Mode::Wind);
    assert_eq!(rig.send(UiCommand::Stop), "ok");
    rig.run_until(stopped).await;

    let line = rig.machine.handler().get_line().unwrap();
    assert!((3..10).contains(&line), "stopped at {}", line);
    assert_eq!(rig.machine.handler().state(), HandlerState::Idle);
    assert_eq!(rig.machine.handler().committed_line(), Some(line));
    assert_eq!(rig.machine.apa().current_line, Some(line));
    assert!(rig.machine.queue().is_empty());
    assert_close(rig.wound(), common::straight_lines_wire(line));
    assert_eq!(rig.machine.snapshot().plc.position, Location::new(100.0 * line as f64, 100.0, 0.0));

    assert_eq!(rig.send(UiCommand::Start), "ok");
    rig.run_until(finished).await;
    assert_close(rig.wound(), common::straight_lines_wire(10));
    assert_eq!(rig.machine.apa().stage, ApaStage::XLayer);
    assert_eq!(rig.machine.apa().current_recipe, None);
    assert!(rig.machine.apa().faults.is_empty());
}

#[tokio::test]
async fn test_stalled_plc_faults_once_and_resumes() {
    let dir = tempdir().unwrap();
    common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let mut rig = Rig::new(dir.path(), SimulatedPlc::new(1)).await;
    rig.load();
    assert_eq!(rig.send(UiCommand::Start), "ok");
    rig.run_until(|m| m.handler().committed_line() >= Some(2)).await;

    rig.plc.stall(true);
    rig.cycle().await;
    assert_eq!(rig.machine.mode(), Mode::Stop);
    assert_eq!(rig.machine.handler().state(), HandlerState::Faulted);
    assert!(rig.machine.queue().is_empty());
    let faults = &rig.machine.apa().faults;
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].kind, "plc");
    assert!(rig.machine.last_error().is_some_and(|e| e.contains("did not answer")));

    let resume_line = rig.machine.handler().get_line().unwrap();
    assert_eq!(rig.machine.apa().current_line, Some(resume_line));
    assert_close(rig.wound(), common::straight_lines_wire(resume_line));

    for _ in 0..3 {
        rig.cycle().await;
    }
    assert_eq!(rig.machine.apa().faults.len(), 1);
    assert!(rig.send(UiCommand::Start).starts_with("error"));

    rig.plc.stall(false);
    for _ in 0..3 {
        rig.cycle().await;
    }
    assert_eq!(rig.send(UiCommand::Start), "ok");
    rig.run_until(finished).await;

    assert_close(rig.wound(), common::straight_lines_wire(10));
    assert_eq!(rig.machine.apa().stage, ApaStage::XLayer);
    assert_eq!(rig.machine.apa().current_recipe, None);
    assert_eq!(rig.machine.apa().faults.len(), 1);
}

#[tokio::test]
async fn test_plc_fault_code_stops_winding() {
    let dir = tempdir().unwrap();
    common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let mut rig = Rig::new(dir.path(), SimulatedPlc::new(1)).await;
    rig.load();
    assert_eq!(rig.send(UiCommand::Start), "ok");
    rig.run_until(|m| m.handler().committed_line() >= Some(1)).await;

    rig.plc.inject_fault(17);
    rig.cycle().await;
    assert_eq!(rig.machine.mode(), Mode::Stop);
    assert!(rig.machine.last_error().is_some_and(|e| e.contains("17")));
    assert!(rig.send(UiCommand::Start).starts_with("error"));

    rig.plc.clear_fault();
    rig.cycle().await;
    assert_eq!(rig.send(UiCommand::Start), "ok");
    rig.run_until(finished).await;
    assert_close(rig.wound(), common::straight_lines_wire(10));
}

#[tokio::test]
async fn test_boot_resumes_the_saved_recipe() {
    let dir = tempdir().unwrap();
    common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let plc = SimulatedPlc::new(1);

    let line = {
        let mut rig = Rig::new(dir.path(), plc.clone()).await;
        rig.load();
        assert_eq!(rig.send(UiCommand::Start), "ok");
        rig.run_until(|m| m.handler().committed_line() >= Some(3)).await;
        rig.send(UiCommand::Stop);
        rig.run_until(stopped).await;
        rig.machine.shutdown().unwrap();
        rig.machine.handler().get_line().unwrap()
    };

    let mut rig = Rig::new(dir.path(), plc).await;
    assert_eq!(rig.machine.mode(), Mode::Stop);
    assert_eq!(rig.machine.handler().state(), HandlerState::Ready);
    assert_eq!(rig.machine.handler().get_line(), Some(line));
    assert_eq!(rig.machine.handler().machine().position, Location::new(100.0 * line as f64, 100.0, 0.0));
    assert_close(rig.wound(), common::straight_lines_wire(line));

    assert_eq!(rig.send(UiCommand::Start), "ok");
    rig.run_until(finished).await;
    assert_close(rig.wound(), common::straight_lines_wire(10));
    assert_eq!(rig.machine.apa().stage, ApaStage::XLayer);
}

#[tokio::test]
async fn test_boot_records_a_missing_recipe() {
    let dir = tempdir().unwrap();
    let (files, _) = common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let mut store = ApaStore::load_or_create(&files, "APA-T", 1).unwrap();
    store.record_mut().set_recipe(files.recipe_path("gone.gc").display().to_string(), 4);
    store.save().unwrap();

    let rig = Rig::new(dir.path(), SimulatedPlc::new(1)).await;
    assert!(rig.machine.handler().session().is_none());
    assert!(rig.machine.last_error().is_some());
    let faults = &rig.machine.apa().faults;
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].kind, "boot");
    assert_eq!(faults[0].line, Some(4));
}

#[tokio::test]
async fn test_calibrate_moves_to_the_pin() {
    let dir = tempdir().unwrap();
    common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let mut rig = Rig::new(dir.path(), SimulatedPlc::new(1)).await;

    assert_eq!(rig.send(UiCommand::Calibrate(PinId::front(3))), "error No recipe loaded");
    rig.load();
    assert!(rig.send(UiCommand::Calibrate(PinId::front(99))).starts_with("error"));
    assert_eq!(rig.send(UiCommand::Calibrate(PinId::front(3))), "ok");

    rig.cycle().await;
    assert_eq!(rig.machine.mode(), Mode::Calibration);
    rig.run_until(stopped).await;

    assert_eq!(rig.machine.snapshot().plc.position, Location::new(7000.0, 300.0, 0.0));
    assert_eq!(rig.machine.handler().machine().active_pin, Some(PinId::front(3)));
    // The recipe is untouched by the seek.
    assert_eq!(rig.machine.handler().get_line(), Some(0));
}

#[tokio::test]
async fn test_manual_moves() {
    let dir = tempdir().unwrap();
    common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let mut rig = Rig::new(dir.path(), SimulatedPlc::new(1)).await;

    let reply = rig.send(UiCommand::Jog { x: 99999.0, y: 0.0, z: 0.0, velocity: None });
    assert!(reply.starts_with("error"), "{}", reply);

    let reply = rig.send(UiCommand::Jog { x: 100.0, y: 200.0, z: 0.0, velocity: Some(50.0) });
    assert_eq!(reply, "ok");
    rig.cycle().await;
    assert_eq!(rig.machine.mode(), Mode::Manual);
    rig.run_until(stopped).await;
    assert!(rig.machine.queue().is_empty());
    assert_eq!(rig.machine.snapshot().plc.position, Location::new(100.0, 200.0, 0.0));

    // Through the frame only from the transfer area.
    assert_eq!(rig.send(UiCommand::Head(FaceSide::Back)), "ok");
    rig.cycle().await;
    rig.run_until(stopped).await;
    assert!(rig.machine.last_error().is_some_and(|e| e.contains("transfer area")));
    assert_eq!(rig.machine.handler().machine().head, FaceSide::Front);
}

#[tokio::test]
async fn test_commands_refused_in_the_wrong_mode() {
    let dir = tempdir().unwrap();
    common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let mut rig = Rig::new(dir.path(), SimulatedPlc::new(1)).await;

    assert_eq!(rig.send(UiCommand::Start), "error No recipe loaded");
    assert!(rig.send(UiCommand::Load { recipe: "missing.gc".to_string(), line: None }).starts_with("error"));

    rig.load();
    assert_eq!(rig.send(UiCommand::Start), "ok");
    rig.cycle().await;
    assert_eq!(rig.machine.mode(), Mode::Wind);
    assert_eq!(rig.send(UiCommand::Load { recipe: RECIPE.to_string(), line: None }), "error busy in wind mode");
    assert_eq!(rig.send(UiCommand::Latch(FaceSide::Back)), "error busy in wind mode");

    assert_eq!(rig.send(UiCommand::Shutdown), "ok shutting down");
    rig.run_until(|m| m.is_quiescent()).await;
    assert_eq!(rig.send(UiCommand::Start), "error shutting down");
    assert!(rig.machine.shutdown_requested());
}

#[tokio::test]
async fn test_jog_with_non_positive_velocity_is_refused() {
    let dir = tempdir().unwrap();
    common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let mut rig = Rig::new(dir.path(), SimulatedPlc::new(1)).await;

    for velocity in [0.0, -5.0, f64::NAN] {
        let reply = rig.send(UiCommand::Jog { x: 100.0, y: 200.0, z: 0.0, velocity: Some(velocity) });
        assert!(reply.starts_with("error Motion limits must be positive"), "{}", reply);
    }
    rig.cycle().await;
    rig.cycle().await;
    assert_eq!(rig.machine.mode(), Mode::Stop);
    assert!(rig.machine.queue().is_empty());
    assert!(rig.plc.submissions().is_empty());
    assert_eq!(rig.machine.handler().machine().position, Location::new(0.0, 0.0, 0.0));
}

#[tokio::test]
async fn test_plc_fault_during_jog_is_recorded() {
    let dir = tempdir().unwrap();
    let (files, _) = common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let mut rig = Rig::new(dir.path(), SimulatedPlc::new(50)).await;

    assert_eq!(rig.send(UiCommand::Jog { x: 100.0, y: 200.0, z: 0.0, velocity: None }), "ok");
    for _ in 0..3 {
        rig.cycle().await;
    }
    assert_eq!(rig.machine.mode(), Mode::Manual);
    assert!(rig.plc.is_busy());
    assert_eq!(rig.machine.handler().machine().position, Location::new(100.0, 200.0, 0.0));

    rig.plc.inject_fault(17);
    rig.run_until(stopped).await;

    assert!(rig.machine.queue().is_empty());
    assert!(rig.machine.last_error().is_some_and(|e| e.contains("17")));
    let faults = &rig.machine.apa().faults;
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].kind, "plc");
    // The planned position follows the PLC, which never got there.
    assert_eq!(rig.machine.snapshot().plc.position, Location::new(0.0, 0.0, 0.0));
    assert_eq!(rig.machine.handler().machine().position, Location::new(0.0, 0.0, 0.0));

    let saved = ApaStore::load_or_create(&files, "APA-T", 1).unwrap();
    assert_eq!(saved.record().faults.len(), 1);
    assert_eq!(saved.record().faults[0].kind, "plc");
    let log = fs::read_to_string(files.log_path()).unwrap();
    assert!(log.lines().any(|line| line.contains("\tmanual\tfault\t") && line.contains("kind=plc")), "{}", log);
}

#[tokio::test]
async fn test_plc_fault_during_calibration_is_recorded() {
    let dir = tempdir().unwrap();
    let (files, _) = common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let mut rig = Rig::new(dir.path(), SimulatedPlc::new(50)).await;
    rig.load();

    assert_eq!(rig.send(UiCommand::Calibrate(PinId::front(3))), "ok");
    for _ in 0..3 {
        rig.cycle().await;
    }
    assert_eq!(rig.machine.mode(), Mode::Calibration);
    assert!(rig.plc.is_busy());

    rig.plc.inject_fault(23);
    rig.run_until(stopped).await;

    assert!(rig.machine.queue().is_empty());
    assert_eq!(rig.machine.handler().machine().position, Location::new(0.0, 0.0, 0.0));
    assert_eq!(rig.machine.apa().faults.len(), 1);
    let saved = ApaStore::load_or_create(&files, "APA-T", 1).unwrap();
    assert!(saved.record().faults[0].message.contains("23"));
    // The recipe position is kept for the next start.
    assert_eq!(rig.machine.handler().get_line(), Some(0));
}

#[tokio::test]
async fn test_calibration_stopped_before_the_seek_is_logged() {
    let dir = tempdir().unwrap();
    let (files, _) = common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let mut rig = Rig::new(dir.path(), SimulatedPlc::new(1)).await;
    rig.load();

    assert_eq!(rig.send(UiCommand::Calibrate(PinId::front(3))), "ok");
    rig.cycle().await;
    assert_eq!(rig.machine.mode(), Mode::Calibration);
    assert_eq!(rig.send(UiCommand::Stop), "ok");
    rig.cycle().await;

    assert_eq!(rig.machine.mode(), Mode::Stop);
    assert!(rig.machine.queue().is_empty());
    assert!(rig.plc.submissions().is_empty());
    let log = fs::read_to_string(files.log_path()).unwrap();
    let stopped = log.lines().find(|line| line.contains("\tcalibration\tstopped\t")).unwrap();
    assert!(stopped.contains("pin=F3"), "{}", stopped);
}

#[tokio::test]
async fn test_record_is_saved_when_manual_mode_exits() {
    let dir = tempdir().unwrap();
    let (files, _) = common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let mut rig = Rig::new(dir.path(), SimulatedPlc::new(1)).await;
    let path = files.apa_path("APA-T");

    assert_eq!(rig.send(UiCommand::Jog { x: 100.0, y: 200.0, z: 0.0, velocity: None }), "ok");
    rig.cycle().await;
    assert_eq!(rig.machine.mode(), Mode::Manual);
    assert!(path.exists());
    fs::remove_file(&path).unwrap();

    rig.run_until(stopped).await;
    assert!(path.exists());
    let saved = ApaStore::load_or_create(&files, "APA-T", 1).unwrap();
    assert_eq!(saved.record(), rig.machine.apa());
}

#[tokio::test]
async fn test_load_fails_hard_when_the_record_cannot_be_saved() {
    let dir = tempdir().unwrap();
    let (files, _) = common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let mut rig = Rig::new(dir.path(), SimulatedPlc::new(1)).await;

    // A plain file where the APA directory should be.
    let apa_dir = files.apa_path("APA-T").parent().unwrap().to_path_buf();
    if apa_dir.exists() {
        fs::remove_dir_all(&apa_dir).unwrap();
    }
    fs::write(&apa_dir, b"").unwrap();

    let result = rig.machine.handle(UiCommand::Load { recipe: RECIPE.to_string(), line: None });
    assert!(matches!(result, Err(MachineError::Persistence(_))), "{:?}", result);
}

#[tokio::test]
async fn test_move_that_never_completes_faults_the_wind() {
    let dir = tempdir().unwrap();
    common::data_dir(dir.path(), RECIPE, &common::straight_lines(10));
    let plc = SimulatedPlc::new(1);
    let mut rig = Rig::with_move_timeout(dir.path(), plc.clone(), Duration::from_millis(20)).await;
    rig.load();

    plc.ignore_moves(true);
    assert_eq!(rig.send(UiCommand::Start), "ok");
    for _ in 0..3 {
        rig.cycle().await;
    }
    assert_eq!(rig.machine.mode(), Mode::Wind);
    tokio::time::sleep(Duration::from_millis(30)).await;
    rig.run_until(stopped).await;

    assert!(rig.machine.last_error().is_some_and(|e| e.contains("did not complete")));
    let faults = &rig.machine.apa().faults;
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].kind, "plc");
    assert!(rig.machine.queue().is_empty());
    assert_close(rig.wound(), 0.0);

    plc.ignore_moves(false);
    rig.cycle().await;
    assert_eq!(rig.send(UiCommand::Start), "ok");
    rig.run_until(finished).await;
    assert_close(rig.wound(), common::straight_lines_wire(10));
}
