//! Calibrate the simulated lab and print the offset sweep
//!
//! Sweeps the link delay so the read index can be seen following it.

use std::time::Duration;

use ccdio_driver::prelude::*;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("ccdio_driver=info")
        .init();

    let config = CalibrationConfig::default().with_settle(Duration::ZERO);
    let plan = CalibrationPlan::upstream()?;

    for delay in [2, 5, 9, 14] {
        let mut session = Session::open(&SessionConfig::simulated(
            SimConfig::default().with_link_delay(delay),
        ))?;
        let mut link = session.upstream_link()?;
        let result = session.calibrate(&mut link, &plan, &config)?;
        println!("delay {delay:>2}  {}  {result}", result.pass_map());
    }

    Ok(())
}
