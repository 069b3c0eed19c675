//! `ccdio`: command-line interface for CC DIO calibration.
//!
//! ```text
//! USAGE:
//!   ccdio [--sim | --cc HOST --uhfqa HOST] <command>
//!
//!   ccdio identify                   *IDN? of every device
//!   ccdio demo [0|1|2]               Lab demo scenario
//!   ccdio calibrate [--staircase N]  Calibrate the UHFQA → CC result bus
//!   ccdio feedback                   Calibrate, then run the feedback loop
//!   ccdio regs [--slot N]            Dump CCIO debug registers
//!   ccdio errors [DEVICE]            Drain a device's error queue
//!   ccdio upload DEVICE FILE         Upload program source text
//! ```
//!
//! Without `--sim` or explicit hosts, `CCDIO_CC_HOST` and `CCDIO_UHFQA_HOST`
//! are used.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ccdio_chip::dio::DioLayout;
use ccdio_chip::program::Syntax;
use ccdio_chip::regs::{CCIO_REG_COUNT, MAX_SLOT};
use ccdio_driver::config::{CC_NAME, DEFAULT_HDAWG_SLOT, UHFQA_NAME};
use ccdio_driver::prelude::*;
use ccdio_driver::sequence;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ccdio", about = "Central Controller DIO calibration CLI", version)]
struct Cli {
    /// Run against the simulated lab.
    #[arg(long, global = true)]
    sim: bool,
    /// CC host name or address.
    #[arg(long, global = true, requires = "uhfqa")]
    cc: Option<String>,
    /// UHFQA host name or address.
    #[arg(long, global = true, requires = "cc")]
    uhfqa: Option<String>,
    /// CCIO slot the UHFQA is cabled to (not the HDAWG's slot 3).
    #[arg(long, global = true, default_value_t = 2, value_parser = parse_readout_slot)]
    slot: u8,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the identity of every device.
    Identify,
    /// Run a lab demo scenario.
    Demo {
        /// 0: upstream calibration, 1: calibration + feedback, 2: codeword loop.
        #[arg(default_value_t = 0)]
        scenario: u8,
    },
    /// Calibrate the UHFQA → CC result bus.
    Calibrate {
        /// Attempts before giving up.
        #[arg(long, default_value_t = 3)]
        attempts: u32,
        /// Settle time per attempt in milliseconds.
        #[arg(long, default_value_t = 200)]
        settle_ms: u64,
        /// Measure only, leave the read index as it is.
        #[arg(long)]
        dry_run: bool,
        /// Check content with a codeword staircase of this many steps.
        #[arg(long)]
        staircase: Option<u32>,
    },
    /// Calibrate, then run the shared-memory feedback loop.
    Feedback {
        /// Loop iterations.
        #[arg(long, default_value_t = 1000)]
        iterations: u32,
        /// Trigger to result latency in CC cycles.
        #[arg(long, default_value_t = 11)]
        latency: u32,
        /// Trace depth per slot, 0 to disable.
        #[arg(long, default_value_t = 0)]
        trace: u32,
        /// Print the CC program instead of running it.
        #[arg(long)]
        print: bool,
    },
    /// Dump CCIO debug registers.
    Regs,
    /// Drain the error queue of a device.
    Errors {
        /// Device name.
        #[arg(default_value = CC_NAME)]
        device: String,
    },
    /// Upload program source text to a device.
    Upload {
        /// Device name.
        device: String,
        /// CC assembly or seqC source.
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    if let Cmd::Feedback { iterations, latency, print: true, .. } = cli.command {
        print!("{}", render_feedback(latency, cli.slot, iterations)?);
        return Ok(());
    }
    let mut session = open_session(&cli)?;

    match cli.command {
        Cmd::Identify => cmd_identify(&mut session)?,
        Cmd::Demo { scenario } => cmd_demo(&mut session, scenario)?,
        Cmd::Calibrate { attempts, settle_ms, dry_run, staircase } => {
            let mut config = CalibrationConfig::default().with_settle(Duration::from_millis(settle_ms));
            if dry_run {
                config = config.without_apply();
            }
            let plan = match staircase {
                Some(steps) => CalibrationPlan::upstream_staircase(steps)?,
                None => CalibrationPlan::upstream()?,
            };
            calibrate(&mut session, &plan, &config, attempts)?;
        }
        Cmd::Feedback { iterations, latency, trace, .. } => {
            let timing = FeedbackTiming::default().with_receiver_latency(latency);
            let fb = feedback_program(timing, session.uhfqa_slot(), iterations)?;
            calibrate_upstream(&mut session, &CalibrationConfig::default(), 3)?;
            run_feedback(&mut session, &fb, trace)?;
        }
        Cmd::Regs => cmd_regs(&mut session)?,
        Cmd::Errors { device } => cmd_errors(&mut session, &device)?,
        Cmd::Upload { device, file } => cmd_upload(&mut session, &device, &file)?,
    }

    Ok(())
}

fn parse_readout_slot(arg: &str) -> std::result::Result<u8, String> {
    let slot: u8 = arg.parse().map_err(|e: std::num::ParseIntError| e.to_string())?;
    if slot > MAX_SLOT {
        return Err(format!("slot {slot} outside 0..={MAX_SLOT}"));
    }
    if slot == DEFAULT_HDAWG_SLOT {
        return Err(format!("slot {slot} drives the HDAWG in the feedback demo"));
    }
    Ok(slot)
}

fn open_session(cli: &Cli) -> Result<Session> {
    let config = if cli.sim {
        SessionConfig::simulated(SimConfig::default())
    } else if let (Some(cc), Some(uhfqa)) = (&cli.cc, &cli.uhfqa) {
        SessionConfig::hardware(cc, uhfqa).with_env_timeout()?
    } else {
        SessionConfig::from_env().context("no instruments given (use --sim or --cc/--uhfqa)")?
    };
    let config = config.with_uhfqa_slot(cli.slot);
    Ok(Session::open(&config)?)
}

fn cmd_identify(session: &mut Session) -> Result<()> {
    for (name, id) in session.identify_all()? {
        println!("{name:<6} {} {}  serial {}  firmware {}", id.vendor, id.model, id.serial, id.firmware);
    }
    Ok(())
}

fn cmd_demo(session: &mut Session, scenario: u8) -> Result<()> {
    match scenario {
        0 => {
            calibrate_upstream(session, &CalibrationConfig::default(), 3)?;
        }
        1 => {
            calibrate_upstream(session, &CalibrationConfig::default(), 3)?;
            let slot = session.uhfqa_slot();
            let fb = feedback_program(FeedbackTiming::default(), slot, 1000)?;
            session.diagnostics(CC_NAME)?.scope_feedback(slot, &[DEFAULT_HDAWG_SLOT])?;
            run_feedback(session, &fb, 256)?;
        }
        2 => {
            calibrate_upstream(session, &CalibrationConfig::default(), 3)?;
            let program = sequence::build_codeword_loop(DioLayout::DV_LSB, &[7, 6, 5, 4], 1, 2)?;
            let uhfqa = session.device_mut(UHFQA_NAME)?;
            uhfqa.instrument_mut().upload(&program)?;
            uhfqa.instrument_mut().start()?;
            println!("UHFQA cycling codewords 7, 6, 5, 4");
            cmd_regs(session)?;
        }
        other => bail!("unknown demo scenario {other} (0, 1 or 2)"),
    }
    Ok(())
}

fn calibrate_upstream(session: &mut Session, config: &CalibrationConfig, attempts: u32) -> Result<()> {
    calibrate(session, &CalibrationPlan::upstream()?, config, attempts)
}

/// The link lives for this call only; its ports are free again on return.
fn calibrate(
    session: &mut Session,
    plan: &CalibrationPlan,
    config: &CalibrationConfig,
    attempts: u32,
) -> Result<()> {
    let mut link = session.upstream_link()?;

    println!("Calibrating {} → {}", link.sender(), link.receiver());
    let result = session.calibrate_with_retries(&mut link, plan, config, attempts)?;
    println!("  offsets   {}", result.pass_map());
    println!("  {result}");
    result.into_valid()?;
    Ok(())
}

fn render_feedback(latency: u32, readout_slot: u8, iterations: u32) -> Result<String> {
    let timing = FeedbackTiming::default().with_receiver_latency(latency);
    let fb = feedback_program(timing, readout_slot, iterations)?;
    Ok(fb.program.render(Syntax::Cc)?)
}

fn feedback_program(timing: FeedbackTiming, readout_slot: u8, iterations: u32) -> Result<FeedbackProgram> {
    let fb = FeedbackBuilder::new(timing)
        .readout(readout_slot, 16, 0)
        .actor(DEFAULT_HDAWG_SLOT, 16, 0)
        .iterations(iterations)
        .build()?;
    Ok(fb)
}

fn run_feedback(session: &mut Session, fb: &FeedbackProgram, trace: u32) -> Result<()> {
    println!(
        "Feedback: {} iterations × {} cycles ({} ns), {:.3} ms total",
        fb.iterations,
        fb.cycles_per_iteration,
        fb.ns_per_iteration,
        fb.total_ns as f64 / 1e6
    );
    let readout = sequence::build_triggered_pattern(0x3FF, 1)?;
    let report = session.run_feedback(fb, &readout, trace)?;
    println!("  status {:#x}", report.status);
    for e in &report.errors {
        println!("  {e}");
    }
    Ok(())
}

fn cmd_regs(session: &mut Session) -> Result<()> {
    let slot = session.uhfqa_slot();
    let mut diag = session.diagnostics(CC_NAME)?;
    for reg in diag.dump_registers(slot, 0..CCIO_REG_COUNT)? {
        println!("{reg}");
    }
    Ok(())
}

fn cmd_errors(session: &mut Session, device: &str) -> Result<()> {
    let errors = session.diagnostics(device)?.drain_errors()?;
    if errors.is_empty() {
        println!("{device}: no errors");
    }
    for e in errors {
        println!("{device}: {e}");
    }
    Ok(())
}

fn cmd_upload(session: &mut Session, device: &str, file: &Path) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    session.device_mut(device)?.instrument_mut().upload_source(&source)?;
    println!("Uploaded {} ({} bytes) to {device}", file.display(), source.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_of_the_actor_rejected() {
        assert!(Cli::try_parse_from(["ccdio", "--sim", "--slot", "3", "identify"]).is_err());
        assert!(Cli::try_parse_from(["ccdio", "--sim", "--slot", "12", "identify"]).is_err());
        let cli = Cli::try_parse_from(["ccdio", "--sim", "--slot", "4", "identify"]).unwrap();
        assert_eq!(cli.slot, 4);
    }

    #[test]
    fn feedback_print_needs_no_session() {
        // no --sim and no hosts: printing must still work
        let cli = Cli::try_parse_from(["ccdio", "feedback", "--print", "--iterations", "5"]).unwrap();
        assert!(!cli.sim && cli.cc.is_none());
        let text = render_feedback(11, cli.slot, 5).unwrap();
        assert!(text.contains("[2] seq_in_sm"));
        assert!(text.contains("[3] seq_out_sm"));
    }
}
