// demos/hot_swap.rs
//
// Simulates an audio thread that keeps rendering while programs are
// recompiled and swapped in behind it.
use dspswap::harness::{views, ScriptCompiler, UnitInputs};
use dspswap::{launch, Command, CompileRequest, EngineConfig, ProcessingUnit};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const FRAMES: usize = 64;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = EngineConfig {
        reclaim_interval_ms: 10,
        ..EngineConfig::default()
    };
    let (mut server, mut client) = launch(&config, Arc::new(ScriptCompiler::new()))?;

    let versions = [
        "outputs 1\nslider Gain 0.25\n",
        "outputs 1\nslider Gain 0.5\n",
        "outputs 1\nslider Gain 0.75\n",
    ];
    let mut current: Option<ProcessingUnit> = None;
    let mut out = vec![0.0f32; FRAMES];

    for (key, source) in (1..).zip(versions) {
        client.compile(CompileRequest::new(key, "", source))?;

        // Keep rendering until the new version is published.
        let mut blocks = 0;
        let outcome = loop {
            server.run_commands();
            if let Some(unit) = current.as_mut() {
                let host = UnitInputs::new(key - 1, FRAMES).channels();
                let inputs = views(&host);
                let mut outputs: [&mut [f32]; 1] = [&mut out];
                server.process(unit, FRAMES, &inputs, &mut outputs);
            }
            blocks += 1;
            if let Some(outcome) = client.poll_outcomes().pop() {
                break outcome;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        println!(
            "version {key}: published={} after {blocks} blocks, last sample {}",
            outcome.is_published(),
            out[0]
        );

        let host = UnitInputs::new(key, FRAMES).channels();
        let inputs = views(&host);
        let next = server.create_unit(&inputs, 1);
        if let Some(old) = current.replace(next) {
            server.destroy_unit(old);
            client.submit(Command::Free { key: key - 1 })?;
        }
        client.drain_signals();
    }

    if let Some(mut unit) = current.take() {
        let host = UnitInputs::new(versions.len() as i32, FRAMES).channels();
        let inputs = views(&host);
        let mut outputs: [&mut [f32]; 1] = [&mut out];
        server.process(&mut unit, FRAMES, &inputs, &mut outputs);
        println!("final version renders {}", out[0]);
        server.destroy_unit(unit);
    }
    server.run_commands();
    println!("programs still registered: {}", server.registry().len());
    client.drain_signals();
    client.shutdown()?;
    Ok(())
}
