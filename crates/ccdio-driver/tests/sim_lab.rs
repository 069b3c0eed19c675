//! End-to-end tests against the simulated lab
//!
//! A CC with the UHFQA on slot 2, cabled both ways, 5 cycles of link delay.

use std::io::Write;
use std::time::Duration;

use ccdio_chip::dio::DioLayout;
use ccdio_chip::regs::{self, diocal_cond, TraceSource};
use ccdio_chip::timing::{UPSTREAM_PATTERN_HIGH, UPSTREAM_PATTERN_PERIOD};
use ccdio_driver::config::{Endpoint, CC_NAME, UHFQA_NAME};
use ccdio_driver::prelude::*;
use ccdio_driver::sequence;
use ccdio_driver::{ErrorKind, SimBus};

fn quick() -> CalibrationConfig {
    CalibrationConfig::default()
        .with_settle(Duration::ZERO)
        .with_poll_interval(Duration::from_millis(1))
}

fn upstream_plan() -> CalibrationPlan {
    CalibrationPlan::upstream().expect("plan")
}

fn open(sim: SimConfig) -> Session {
    Session::open(&SessionConfig::simulated(sim)).expect("simulated session")
}

fn open_with_bus(sim: SimConfig) -> (Session, SimBus) {
    let config = SessionConfig::simulated(sim);
    let Endpoint::Simulated(bus) = config.uhfqa.endpoint.clone() else {
        panic!("simulated config without bus");
    };
    (Session::open(&config).expect("simulated session"), bus)
}

/// Codewords 0 and 1 with data-valid, then idle, 3 cycles each.
fn staircase_plan() -> CalibrationPlan {
    CalibrationPlan::upstream_staircase(2).expect("content plan")
}

#[test]
fn test_upstream_calibration_centres_on_window() {
    let mut session = open(SimConfig::default());
    let mut link = session.upstream_link().expect("link");

    let result = session.calibrate(&mut link, &upstream_plan(), &quick()).expect("calibrate");

    assert!(result.is_valid(), "{result}");
    assert_eq!(result.read_index, 6);
    assert_eq!(result.margin, 1);
    assert_eq!(result.run, Some((5, 3)));
    assert_eq!(link.calibrated(), Some(&result));

    let mut diag = session.diagnostics(CC_NAME).expect("diagnostics");
    let index = diag.read_status(2, regs::SYS_ST_OPER_DIO_RD_INDEX).expect("read index");
    assert_eq!(index.value, 6);
}

#[test]
fn test_longer_delay_moves_read_index() {
    let mut session = open(SimConfig::default().with_link_delay(9));
    let mut link = session.upstream_link().expect("link");
    let result = session.calibrate(&mut link, &upstream_plan(), &quick()).expect("calibrate");
    assert_eq!(result.read_index, 10);
}

#[test]
fn test_without_apply_leaves_index_untouched() {
    let mut session = open(SimConfig::default());
    let mut link = session.upstream_link().expect("link");
    let result = session
        .calibrate(&mut link, &upstream_plan(), &quick().without_apply())
        .expect("calibrate");
    assert!(result.is_valid());

    let mut diag = session.diagnostics(CC_NAME).expect("diagnostics");
    let index = diag.read_status(2, regs::SYS_ST_OPER_DIO_RD_INDEX).expect("read index");
    assert_eq!(index.value, -1);
}

#[test]
fn test_link_calibrates_once() {
    let mut session = open(SimConfig::default());
    let mut link = session.upstream_link().expect("link");
    session.calibrate(&mut link, &upstream_plan(), &quick()).expect("first");

    let err = session.calibrate(&mut link, &upstream_plan(), &quick()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_persistent_fault_fails_calibration() {
    let mut session = open(SimConfig::default().with_stuck_condition(diocal_cond::UNSTABLE));
    let mut link = session.upstream_link().expect("link");

    let result = session
        .calibrate_with_retries(&mut link, &upstream_plan(), &quick(), 3)
        .expect("attempts complete");

    assert!(!result.is_valid());
    assert_ne!(result.condition & diocal_cond::UNSTABLE, 0);
    assert!(link.calibrated().is_none());
    assert!(matches!(result.into_valid(), Err(DioError::CalibrationFailure { .. })));
}

#[test]
fn test_transient_fault_is_tolerated() {
    let mut session = open(SimConfig::default().with_transient_condition(diocal_cond::UNSTABLE));
    let mut link = session.upstream_link().expect("link");
    let result = session.calibrate(&mut link, &upstream_plan(), &quick()).expect("calibrate");
    assert!(result.is_valid(), "{result}");
}

#[test]
fn test_triggered_sender_needs_trigger_program() {
    let mut session = open(SimConfig::default());
    let mut link = session.upstream_link().expect("link");
    let plan = CalibrationPlan {
        trigger_program: None,
        ..upstream_plan()
    };

    // a triggered sender without a trigger is rejected before any I/O
    let err = session.calibrate(&mut link, &plan, &quick()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_content_calibration_centres_on_window() {
    let mut session = open(SimConfig::default());
    let mut link = session.upstream_link().expect("link");
    let plan = staircase_plan();
    assert_eq!(plan.expected.pairs(), &[(1, 3), (3, 3), (0, 3)]);

    let result = session.calibrate(&mut link, &plan, &quick()).expect("calibrate");

    assert!(result.is_valid(), "{result}");
    assert_eq!(result.read_index, 6);
    assert_eq!(result.margin, 1);
    assert_eq!(result.run, Some((5, 3)));
    assert_eq!(link.calibrated(), Some(&result));
}

#[test]
fn test_wrong_expected_content_finds_no_pass() {
    let mut session = open(SimConfig::default());
    let mut link = session.upstream_link().expect("link");
    // sender replays the staircase, receiver expects codewords 2 and 3
    let plan = CalibrationPlan {
        expected: ExpectedSequence::new(vec![(5, 3), (7, 3), (0, 3)]).expect("sequence"),
        ..staircase_plan()
    };

    let result = session.calibrate(&mut link, &plan, &quick()).expect("attempt completes");

    assert!(!result.is_valid());
    assert_eq!(result.condition, diocal_cond::NO_PASS);
    assert_eq!(result.read_index, -1);
    assert!(result.pass.iter().all(|&p| !p));
    assert!(link.calibrated().is_none());
}

#[test]
fn test_zero_min_margin_rejected() {
    let mut session = open(SimConfig::default());
    let mut link = session.upstream_link().expect("link");
    // one-cycle pulse: a single passing offset with no margin
    let plan = CalibrationPlan::triggered_pulse(0x3FF, 1, DioLayout::CC_TO_UHFQA.mask(), UPSTREAM_PATTERN_PERIOD)
        .expect("plan");

    let err = session
        .calibrate(&mut link, &plan, &quick().with_min_margin(0))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(link.calibrated().is_none());

    // the default margin turns the same sweep into a failed result
    let result = session.calibrate(&mut link, &plan, &quick()).expect("attempt completes");
    assert!(!result.is_valid());
    assert_eq!(result.condition, diocal_cond::MARGIN_LOW);
}

#[test]
fn test_aborted_run_stops_both_devices() {
    let (mut session, bus) = open_with_bus(SimConfig::default().with_refused_start(CC_NAME));
    let mut link = session.upstream_link().expect("link");

    // the UHFQA starts first, then the CC refuses
    let err = session.calibrate(&mut link, &upstream_plan(), &quick()).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Communication);
    assert!(err.to_string().contains("start refused"), "{err}");
    assert!(!bus.is_running(UHFQA_NAME));
    assert!(!bus.is_running(CC_NAME));
}

#[test]
fn test_dropped_link_frees_ports_for_recalibration() {
    let mut session = open(SimConfig::default());
    {
        let mut link = session.upstream_link().expect("link");
        session.calibrate(&mut link, &upstream_plan(), &quick()).expect("first");
    }
    let mut link = session.upstream_link().expect("ports free again");
    let result = session.calibrate(&mut link, &upstream_plan(), &quick()).expect("second");
    assert!(result.is_valid(), "{result}");
}

#[test]
fn test_free_running_sender() {
    let mut session = open(SimConfig::default());
    let mut link = session.upstream_link().expect("link");
    let plan = CalibrationPlan::free_running(0x3FF, UPSTREAM_PATTERN_HIGH, UPSTREAM_PATTERN_PERIOD).expect("plan");
    let result = session.calibrate(&mut link, &plan, &quick()).expect("calibrate");
    assert!(result.is_valid(), "{result}");
    assert_eq!(result.read_index, 6);
}

#[test]
fn test_link_loss_surfaces_after_retries() {
    // open consumes reset and clear on both devices plus the CC's questionable enable
    let mut session = open(SimConfig::default().with_fail_after_calls(5));
    let mut link = session.upstream_link().expect("link");

    let err = session
        .calibrate_with_retries(&mut link, &upstream_plan(), &quick(), 2)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Communication);
    assert!(link.calibrated().is_none());
}

fn feedback(timing: FeedbackTiming) -> FeedbackProgram {
    FeedbackBuilder::new(timing)
        .readout(2, 16, 0)
        .actor(3, 16, 0)
        .iterations(8)
        .build()
        .expect("feedback program")
}

#[test]
fn test_feedback_runs_clean_at_stable_latency() {
    let mut session = open(SimConfig::default());
    let readout = sequence::build_triggered_pattern(0x3FF, 1).expect("readout program");

    let report = session
        .run_feedback(&feedback(FeedbackTiming::default()), &readout, 256)
        .expect("feedback run");

    assert_eq!(report.status, 0);
    assert!(report.errors.is_empty());
}

#[test]
fn test_feedback_traces_every_source() {
    let (mut session, bus) = open_with_bus(SimConfig::default());
    let readout = sequence::build_triggered_pattern(0x3FF, 1).expect("readout program");

    session
        .run_feedback(&feedback(FeedbackTiming::default()), &readout, 256)
        .expect("feedback run");

    for slot in [2, 3] {
        for source in TraceSource::ALL {
            assert_eq!(bus.trace_depth(CC_NAME, slot, source), Some(256), "slot {slot} {source:?}");
        }
    }
}

#[test]
fn test_feedback_too_early_read_is_violation() {
    let mut session = open(SimConfig::default());
    let readout = sequence::build_triggered_pattern(0x3FF, 1).expect("readout program");
    let early = feedback(FeedbackTiming::default().with_receiver_latency(10));

    let err = session.run_feedback(&early, &readout, 0).unwrap_err();

    match err {
        DioError::ProtocolViolation { raw, .. } => {
            assert!(raw.starts_with("0x1"), "{raw}");
            assert!(raw.contains("SEQ_IN_EMPTY"), "{raw}");
        }
        other => panic!("expected protocol violation, got {other}"),
    }
}

#[test]
fn test_upload_seqc_from_file() {
    let (mut session, bus) = open_with_bus(SimConfig::default());

    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "while (1) {{\n    waitDIOTrigger();\n    setDIO(0x3ff);\n}}").expect("write");
    let source = std::fs::read_to_string(file.path()).expect("read back");

    let uhfqa = session.device_mut(UHFQA_NAME).expect("uhfqa");
    uhfqa.instrument_mut().upload_source(&source).expect("upload");

    assert_eq!(bus.source(UHFQA_NAME).as_deref(), Some(source.as_str()));
    assert!(bus.program(UHFQA_NAME).is_none());
}
