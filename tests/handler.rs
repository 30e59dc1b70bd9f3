mod common;

use apa_winder::calibration::{CalibrationError, PinId, PinTable};
use apa_winder::config::Config;
use apa_winder::gcode::{BlockReason, GCodeHandler, HandlerError, HandlerState, StepOutcome};
use apa_winder::geometry::{FaceSide, Location, SeekError, TransferBox, TransferEdge};
use apa_winder::motion::{MotionPrimitive, MotionQueue};

fn ready_queue(capacity: usize) -> MotionQueue {
    let queue = MotionQueue::new(capacity);
    queue.set_consumer_ready(true);
    queue
}

/// Stand in for the PLC: retire the front entry.
fn complete_front(queue: &MotionQueue) {
    let front = queue.front().expect("queue has an entry");
    assert!(queue.complete(front.seq));
}

fn loaded(statements: &str) -> GCodeHandler {
    let mut handler = common::handler();
    handler.load_recipe(common::recipe(statements), 0).unwrap();
    handler
}

fn destinations(queue: &MotionQueue) -> Vec<MotionPrimitive> {
    let mut primitives = Vec::new();
    while let Some(front) = queue.front() {
        primitives.push(front.primitive.clone());
        queue.complete(front.seq);
    }
    primitives
}

#[test]
fn test_pin_pair_moves_to_midpoint() {
    let table = PinTable::new("X", 0.0, 100.0, [(PinId::front(1), 10.0, 0.0), (PinId::back(1), 10.0, 0.0)]).unwrap();
    let mut handler = common::handler_for(&Config::default(), table);
    handler.load_recipe(common::recipe("N1 G108 F1 B1\n"), 0).unwrap();
    let queue = ready_queue(4);

    assert_eq!(handler.step(&queue).unwrap(), StepOutcome::Advanced);
    match queue.front().map(|entry| entry.primitive) {
        Some(MotionPrimitive::Move { to, .. }) => assert_eq!(to, Location::new(10.0, 0.0, 50.0)),
        other => panic!("expected a move, got {:?}", other),
    }
    assert_eq!(handler.machine().active_pin, Some(PinId::front(1)));
    assert_eq!(handler.state(), HandlerState::Done);
}

#[test]
fn test_seek_stops_on_the_transfer_edge() {
    let mut config = Config::default();
    config.transfer = TransferBox { top: 500.0, bottom: 0.0, left: 20.0, right: 1000.0, window: 5.0 };
    let mut handler = common::handler_for(&config, common::pin_table());
    handler.load_recipe(common::recipe("N1 G1 X100 Y100\nN2 G102 P1\n"), 0).unwrap();
    let queue = ready_queue(4);

    handler.step(&queue).unwrap();
    handler.step(&queue).unwrap();
    let primitives = destinations(&queue);
    assert_eq!(primitives.len(), 2);
    match &primitives[1] {
        MotionPrimitive::Seek { edge, to, .. } => {
            assert_eq!(*edge, TransferEdge::Top);
            assert_eq!(*to, Location::new(500.0, 500.0, 0.0));
        }
        other => panic!("expected a seek, got {:?}", other),
    }
    let expected = 500.0 * 2f64.sqrt();
    assert!((handler.running_stats().wire_length - expected).abs() < 1e-9);
}

#[test]
fn test_head_crossing_adds_z_travel_to_the_wire() {
    let mut handler = loaded("N1 G1 X7174 Y100\nN2 G106 P3\n");
    let queue = ready_queue(4);

    handler.step(&queue).unwrap();
    handler.step(&queue).unwrap();
    assert_eq!(handler.machine().head, FaceSide::Back);
    assert_eq!(handler.machine().position.z, 434.0);

    // Nothing is committed until the PLC finishes.
    assert_eq!(handler.committed_wire_length(), 0.0);
    complete_front(&queue);
    complete_front(&queue);
    handler.settle(&queue);

    let expected = 7174f64.hypot(100.0) + 434.0;
    assert!((handler.committed_wire_length() - expected).abs() < 1e-9);
    assert_eq!(handler.committed_line(), Some(2));
}

#[test]
fn test_head_crossing_outside_transfer_area_faults() {
    let mut handler = loaded("N1 G1 X3000 Y1000\nN2 G106 P3\n");
    let queue = ready_queue(4);

    handler.step(&queue).unwrap();
    let err = handler.step(&queue).unwrap_err();
    assert!(matches!(err, HandlerError::NotInTransferArea { .. }), "{}", err);
    assert_eq!(handler.state(), HandlerState::Faulted);
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_move_to_current_position_emits_nothing() {
    let mut handler = loaded("N1 G1 X0 Y0\n");
    let queue = ready_queue(4);

    assert_eq!(handler.step(&queue).unwrap(), StepOutcome::Advanced);
    assert!(queue.is_empty());
    assert_eq!(handler.running_stats().wire_length, 0.0);
    assert_eq!(handler.state(), HandlerState::Done);
    assert_eq!(handler.step(&queue).unwrap(), StepOutcome::Finished);
}

#[test]
fn test_seek_without_direction_faults() {
    let mut handler = loaded("N1 G102 P8\n");
    let queue = ready_queue(4);

    let err = handler.step(&queue).unwrap_err();
    assert!(matches!(err, HandlerError::Seek(SeekError::NoDirection)), "{}", err);
    assert_eq!(handler.state(), HandlerState::Faulted);
    assert!(matches!(handler.step(&queue), Err(HandlerError::Faulted)));
}

#[test]
fn test_out_of_bounds_target_faults() {
    let mut handler = loaded("N1 G1 X99999\n");
    let queue = ready_queue(4);
    assert!(matches!(handler.step(&queue), Err(HandlerError::OutOfBounds { .. })));
    assert!(queue.is_empty());
}

#[test]
fn test_line_longer_than_the_queue_faults() {
    let mut handler = loaded("N1 G1 X10 G4 P1 G100 P1\n");
    let queue = ready_queue(2);

    match handler.step(&queue) {
        Err(HandlerError::LineTooLong { line, needed, capacity }) => {
            assert_eq!((line, needed, capacity), (0, 3, 2));
        }
        other => panic!("expected LineTooLong, got {:?}", other),
    }
    assert!(queue.is_empty());
}

#[test]
fn test_full_queue_takes_nothing_from_the_line() {
    let mut handler = loaded("N1 G1 X10 G4 P5\nN2 G1 X20\n");
    let queue = ready_queue(4);
    for _ in 0..3 {
        queue.push(None, MotionPrimitive::Dwell { ms: 1 }).unwrap();
    }

    assert_eq!(handler.step(&queue).unwrap(), StepOutcome::Blocked(BlockReason::QueueFull));
    assert_eq!(queue.len(), 3);
    assert_eq!(handler.get_line(), Some(0));
    assert_eq!(handler.state(), HandlerState::Blocked);

    complete_front(&queue);
    assert_eq!(handler.step(&queue).unwrap(), StepOutcome::Advanced);
    assert_eq!(queue.len(), 4);
    assert_eq!(handler.get_line(), Some(1));
}

#[test]
fn test_consumer_not_ready_blocks() {
    let mut handler = loaded(&common::straight_lines(2));
    let queue = MotionQueue::new(4);

    assert_eq!(handler.step(&queue).unwrap(), StepOutcome::Blocked(BlockReason::PlcNotReady));
    assert!(queue.is_empty());
    queue.set_consumer_ready(true);
    assert_eq!(handler.step(&queue).unwrap(), StepOutcome::Advanced);
}

#[test]
fn test_fault_rewinds_to_first_unfinished_line() {
    let mut handler = loaded(&common::straight_lines(5));
    let queue = ready_queue(8);
    for _ in 0..3 {
        handler.step(&queue).unwrap();
    }
    complete_front(&queue);
    handler.settle(&queue);
    assert_eq!(handler.committed_line(), Some(1));

    let dropped = queue.clear();
    let first_unfinished = dropped.iter().filter_map(|entry| entry.line).min();
    assert_eq!(first_unfinished, Some(1));
    handler.fault(first_unfinished);

    assert_eq!(handler.state(), HandlerState::Faulted);
    assert_eq!(handler.get_line(), Some(1));
    assert_eq!(handler.machine().position, Location::new(100.0, 100.0, 0.0));
    let first = common::straight_lines_wire(1);
    assert!((handler.running_stats().wire_length - first).abs() < 1e-9);
    assert!((handler.committed_wire_length() - first).abs() < 1e-9);
    assert!(matches!(handler.step(&queue), Err(HandlerError::Faulted)));

    handler.arm().unwrap();
    assert_eq!(handler.state(), HandlerState::Ready);
    assert_eq!(handler.step(&queue).unwrap(), StepOutcome::Advanced);
    match queue.front().map(|entry| (entry.line, entry.primitive)) {
        Some((Some(1), MotionPrimitive::Move { to, .. })) => assert_eq!(to, Location::new(200.0, 100.0, 0.0)),
        other => panic!("expected line 1 to be re-emitted, got {:?}", other),
    }
}

#[test]
fn test_stop_and_drain_are_idempotent() {
    let mut handler = loaded(&common::straight_lines(5));
    let queue = ready_queue(4);
    handler.step(&queue).unwrap();

    handler.request_stop();
    handler.request_stop();
    assert_eq!(handler.state(), HandlerState::Stopping);
    assert_eq!(handler.step(&queue).unwrap(), StepOutcome::Blocked(BlockReason::Stopping));
    assert!(!handler.drain(queue.is_empty()));

    complete_front(&queue);
    assert!(handler.drain(queue.is_empty()));
    assert!(handler.drain(queue.is_empty()));
    assert_eq!(handler.state(), HandlerState::Idle);
    assert_eq!(handler.committed_line(), Some(1));

    handler.request_stop();
    assert_eq!(handler.state(), HandlerState::Idle);
    handler.arm().unwrap();
    assert_eq!(handler.state(), HandlerState::Ready);
}

#[test]
fn test_break_stops_after_its_line() {
    let mut handler = loaded("N1 G1 X10\nN2 M0\nN3 G1 X20\n");
    let queue = ready_queue(4);

    assert_eq!(handler.step(&queue).unwrap(), StepOutcome::Advanced);
    assert_eq!(handler.step(&queue).unwrap(), StepOutcome::Break);
    assert_eq!(handler.state(), HandlerState::Stopping);
    assert_eq!(handler.get_line(), Some(2));
    assert_eq!(handler.step(&queue).unwrap(), StepOutcome::Blocked(BlockReason::Stopping));
}

#[test]
fn test_load_checks_pins_and_start_line() {
    let mut handler = common::handler();
    let err = handler.load_recipe(common::recipe("N1 G108 F99\n"), 0).unwrap_err();
    assert!(matches!(err, HandlerError::Calibration(CalibrationError::UnknownPin(pin)) if pin == PinId::front(99)));
    assert!(handler.session().is_none());

    let err = handler.load_recipe(common::recipe(&common::straight_lines(3)), 4).unwrap_err();
    assert!(matches!(err, HandlerError::LineOutOfRange { line: 4, len: 3 }));

    handler.load_recipe(common::recipe(&common::straight_lines(3)), 3).unwrap();
    let queue = ready_queue(4);
    assert_eq!(handler.step(&queue).unwrap(), StepOutcome::Finished);
}

#[test]
fn test_manual_moves_refused_while_running() {
    let mut handler = loaded(&common::straight_lines(3));
    let queue = ready_queue(4);
    handler.step(&queue).unwrap();

    let err = handler.jog(&queue, Location::new(1.0, 1.0, 0.0), None).unwrap_err();
    assert!(matches!(err, HandlerError::Busy(HandlerState::Emitting)));
    assert!(handler.load_recipe(common::recipe("N1 G1 X1\n"), 0).is_err());
}

#[test]
fn test_jog_rejects_non_positive_velocity() {
    let mut handler = common::handler();
    let queue = ready_queue(4);

    for velocity in [0.0, -5.0, f64::NAN] {
        let err = handler.jog(&queue, Location::new(100.0, 200.0, 0.0), Some(velocity)).unwrap_err();
        assert!(matches!(err, HandlerError::InvalidLimits { .. }), "{}", err);
    }
    assert!(queue.is_empty());
    assert_eq!(handler.machine().position, Location::new(0.0, 0.0, 0.0));

    let primitive = handler.jog(&queue, Location::new(100.0, 200.0, 0.0), Some(25.0)).unwrap();
    assert!(matches!(primitive, MotionPrimitive::Move { limits, .. } if limits.velocity == 25.0));
    assert_eq!(handler.machine().position, Location::new(100.0, 200.0, 0.0));
}

#[test]
fn test_manual_move_on_a_full_queue_changes_nothing() {
    let mut handler = common::handler_for(&Config::default(), common::pin_table());
    handler.load_recipe(common::recipe("N1 G1 X10 Y10\n"), 0).unwrap();
    let queue = ready_queue(1);
    handler.jog(&queue, Location::new(100.0, 200.0, 0.0), None).unwrap();
    let before = handler.machine().clone();

    let err = handler.jog(&queue, Location::new(300.0, 300.0, 0.0), None).unwrap_err();
    assert!(matches!(err, HandlerError::QueueFull(_)), "{}", err);
    assert!(matches!(handler.manual_latch(&queue, FaceSide::Back), Err(HandlerError::QueueFull(_))));
    assert!(matches!(handler.seek_pin(&queue, PinId::front(2)), Err(HandlerError::QueueFull(_))));
    assert_eq!(handler.machine(), &before);
    assert_eq!(queue.len(), 1);

    complete_front(&queue);
    handler.seek_pin(&queue, PinId::front(2)).unwrap();
    assert_eq!(handler.machine().position, Location::new(7000.0, 200.0, 0.0));
    assert_eq!(handler.machine().active_pin, Some(PinId::front(2)));
}

/// Lines (horizontal?, value) making up `edge`.
fn edge_lines(area: &TransferBox, edge: TransferEdge) -> Vec<(bool, f64)> {
    let (top, bottom, left, right) = ((true, area.top), (true, area.bottom), (false, area.left), (false, area.right));
    match edge {
        TransferEdge::Top => vec![top],
        TransferEdge::Bottom => vec![bottom],
        TransferEdge::Left => vec![left],
        TransferEdge::Right => vec![right],
        TransferEdge::TopLeft => vec![top, left],
        TransferEdge::TopRight => vec![top, right],
        TransferEdge::BottomLeft => vec![bottom, left],
        TransferEdge::BottomRight => vec![bottom, right],
    }
}

#[test]
fn test_seek_intercept_over_all_directions() {
    let area = TransferBox { top: 500.0, bottom: 0.0, left: 20.0, right: 1000.0, window: 5.0 };
    let edges = [
        TransferEdge::Top,
        TransferEdge::Bottom,
        TransferEdge::Left,
        TransferEdge::Right,
        TransferEdge::TopLeft,
        TransferEdge::TopRight,
        TransferEdge::BottomLeft,
        TransferEdge::BottomRight,
    ];
    let starts = [Location::new(100.0, 100.0, 0.0), Location::new(510.0, 250.0, 7.0), Location::new(990.0, 480.0, 0.0)];

    for from in starts {
        // Half-degree offset keeps both components clear of zero.
        for step in 0..360 {
            let angle = (step as f64 + 0.5).to_radians();
            let (dx, dy) = (angle.cos(), angle.sin());
            for edge in edges {
                let lines = edge_lines(&area, edge);
                let nearest = lines
                    .iter()
                    .map(|&(horizontal, value)| if horizontal { (value - from.y) / dy } else { (value - from.x) / dx })
                    .filter(|t| *t > 0.0)
                    .fold(None, |best: Option<f64>, t| Some(best.map_or(t, |b| b.min(t))));

                match (area.intercept(from, dx, dy, edge), nearest) {
                    (Ok(hit), Some(t)) => {
                        let expected = Location::new(from.x + t * dx, from.y + t * dy, from.z);
                        assert!(hit.approx_eq(&expected), "{:?} from {} at {}: {} vs {}", edge, from, step, hit, expected);
                        assert!(lines.iter().any(|&(horizontal, value)| {
                            let coordinate = if horizontal { hit.y } else { hit.x };
                            (coordinate - value).abs() < 1e-6
                        }));
                        // Ahead of the start along the ray.
                        assert!((hit.x - from.x) * dx + (hit.y - from.y) * dy > 0.0);
                    }
                    (Err(SeekError::NoIntercept(missed)), None) => assert_eq!(missed, edge),
                    (result, nearest) => panic!("{:?} from {} at {}: {:?} vs {:?}", edge, from, step, result, nearest),
                }
            }
        }
    }
}

#[test]
fn test_wire_length_is_the_sum_of_the_moves() {
    let mut state: u64 = 0xa5a5;
    let mut next = |n: u64| {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 33) % n
    };
    let points: Vec<(f64, f64)> = (0..60).map(|_| (next(7000) as f64 + 0.25, next(2800) as f64 + 0.5)).collect();
    let statements: String = points
        .iter()
        .enumerate()
        .map(|(index, (x, y))| format!("N{} G1 X{} Y{}\n", index + 1, x, y))
        .collect();
    let expected: f64 = points
        .iter()
        .scan((0.0, 0.0), |from, &(x, y)| {
            let length = (x - from.0).hypot(y - from.1);
            *from = (x, y);
            Some(length)
        })
        .sum();

    let mut handler = loaded(&statements);
    let queue = ready_queue(4);
    loop {
        match handler.step(&queue).unwrap() {
            StepOutcome::Finished => break,
            StepOutcome::Blocked(_) => {
                complete_front(&queue);
                handler.settle(&queue);
            }
            _ => {}
        }
    }
    while queue.front().is_some() {
        complete_front(&queue);
    }
    handler.settle(&queue);

    assert!((handler.running_stats().wire_length - expected).abs() < 1e-6);
    assert!((handler.committed_wire_length() - expected).abs() < 1e-6);
    assert_eq!(handler.committed_line(), Some(points.len()));
}
