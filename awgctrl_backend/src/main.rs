use std::sync::Arc;

use awgcompiler_backend::prelude::*;
use awgctrl_backend::{ProgramRegistry, SimulatedAwg};
use tracing_subscriber::EnvFilter;

fn simulated(name: &str, _address: Option<&str>, channels: &[u8]) -> Result<Box<dyn AwgTransport>> {
    Ok(Box::new(SimulatedAwg::new(name, channels)))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Arc::new(AwgConfig::default());
    let mut registry = ProgramRegistry::connect(config.clone(), false, simulated)?;

    let mut rabi = MultiChSeq::new("rabi", config, None)?;
    rabi.start_new_segment("init", SegmentOptions::default(), false)?;
    rabi.add_step(StepSpec::new("polarize").length_mus(2.).marker("green", true))?;
    rabi.start_new_segment("pulse", SegmentOptions::default(), false)?;
    rabi.add_step(
        StepSpec::new("pi")
            .length_mus(0.5)
            .channel(ChannelId::new("2g", 1), StepParams::sine(vec![30.], vec![0.8])),
    )?;
    rabi.start_new_segment("init", SegmentOptions::default(), true)?;
    registry.insert(rabi)?;

    registry.run("rabi", true)?;
    registry.stop_awgs()?;
    println!("{}", registry);
    println!("{}", registry.get("rabi")?);
    registry.remove("rabi")?;
    Ok(())
}
