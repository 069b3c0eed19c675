//! Lab hardware validation
//!
//! Needs `CCDIO_CC_HOST` and `CCDIO_UHFQA_HOST` pointing at a CC with the
//! UHFQA cabled to slot 2.

use std::time::Duration;

use ccdio_driver::prelude::*;
use ccdio_driver::sequence;

#[test]
#[ignore] // Requires hardware
fn test_identify_lab() {
    let mut session = Session::open(&SessionConfig::from_env().expect("env")).expect("open");
    for (name, id) in session.identify_all().expect("identify") {
        println!("{name}: {} {} (fw {})", id.vendor, id.model, id.firmware);
        assert!(!id.serial.is_empty());
    }
}

#[test]
#[ignore] // Requires hardware
fn test_upstream_calibration() {
    let mut session = Session::open(&SessionConfig::from_env().expect("env")).expect("open");
    let mut link = session.upstream_link().expect("link");
    let plan = CalibrationPlan::upstream().expect("plan");

    let result = session
        .calibrate_with_retries(&mut link, &plan, &CalibrationConfig::default(), 3)
        .expect("calibrate");

    println!("{result}");
    println!("  {}", result.pass_map());
    assert!(result.is_valid());
}

#[test]
#[ignore] // Requires hardware
fn test_feedback_after_calibration() {
    let mut session = Session::open(&SessionConfig::from_env().expect("env")).expect("open");
    let mut link = session.upstream_link().expect("link");
    let plan = CalibrationPlan::upstream().expect("plan");
    session
        .calibrate(&mut link, &plan, &CalibrationConfig::default())
        .expect("calibrate")
        .into_valid()
        .expect("valid calibration");

    let fb = FeedbackBuilder::new(FeedbackTiming::default())
        .readout(2, 16, 0)
        .actor(3, 16, 0)
        .iterations(1000)
        .build()
        .expect("program");
    assert!(fb.suggested_timeout() < Duration::from_secs(10));
    let readout = sequence::build_triggered_pattern(0x3FF, 1).expect("readout");

    let report = session.run_feedback(&fb, &readout, 1024).expect("feedback");
    println!("status {:#x}, {} queued errors", report.status, report.errors.len());
}
