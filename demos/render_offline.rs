// demos/render_offline.rs
use dspswap::harness::{views, RtHarness, UnitInputs};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let sample_rate = 44_100u32;
    let block = 512usize;
    let mut harness = RtHarness::new(4, 1 << 20);
    harness.sample_rate = sample_rate;
    let outcome = harness.publish(1, "inputs 1\noutputs 1\nslider Gain 0.5\n");
    println!("published: {}", outcome.is_published());

    // 440Hz sine fed through the program, gain ramping up over the second.
    let total = sample_rate as usize;
    let mut samples = Vec::with_capacity(total);
    let mut unit = None;
    let mut phase = 0.0f32;
    let step = 440.0 * std::f32::consts::TAU / sample_rate as f32;
    let mut out = vec![0.0f32; block];

    for start in (0..total).step_by(block) {
        let frames = block.min(total - start);
        let sine: Vec<f32> = (0..frames)
            .map(|_| {
                let s = phase.sin();
                phase = (phase + step) % std::f32::consts::TAU;
                s
            })
            .collect();
        let gain = start as f32 / total as f32;
        let channels = UnitInputs::new(1, frames).audio(sine).param(0.0, gain).channels();
        let inputs = views(&channels);
        let unit = unit.get_or_insert_with(|| harness.unit(&inputs, 1));
        let mut outputs: [&mut [f32]; 1] = [&mut out[..frames]];
        unit.process(frames, &inputs, &mut outputs);
        samples.extend_from_slice(&out[..frames]);
    }
    if let Some(unit) = unit {
        harness.teardown(unit);
    }

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create("render.wav", spec)?;
    for &sample in &samples {
        writer.write_sample((sample * 32767.0) as i16)?;
    }
    writer.finalize()?;

    println!("Generated render.wav - a 440Hz tone fading in");
    Ok(())
}
