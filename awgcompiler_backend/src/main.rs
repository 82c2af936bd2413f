use std::sync::Arc;

use awgcompiler_backend::prelude::*;

fn main() -> Result<()> {
    let config = Arc::new(AwgConfig::single("awg", &[1, 2]));
    let mut prog = MultiChSeq::new("demo", config, None)?;
    prog.start_new_segment("init", SegmentOptions::default(), false)?;
    prog.add_step(StepSpec::new("wait").length_mus(1.))?;
    prog.add_step(
        StepSpec::new("pi").length_mus(2.).channel(
            ChannelId::new("awg", 1),
            StepParams::sine(vec![2.], vec![1.]).sync_marker(true),
        ),
    )?;
    prog.start_new_segment("init", SegmentOptions::default().loop_count(3), true)?;
    prog.write_seq()?;
    println!("{}", prog);

    for (id, payload) in prog.compile_payloads()? {
        let records = records_from_bytes(&payload.table)?;
        println!(
            "{}: {} segments, {} bytes of samples, table {:?}",
            id,
            payload.segments.len(),
            payload.segments.iter().map(|s| s.len()).sum::<usize>(),
            records
        );
    }
    Ok(())
}
