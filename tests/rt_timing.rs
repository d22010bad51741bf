use dspswap::harness::{views, RtHarness, UnitInputs};
use std::time::Instant;

#[test]
fn rt_timing_stability() {
    // Worst case for the binding loop: many parameters, all driven.
    let mut source = String::from("inputs 2\noutputs 2\n");
    for i in 0..64 {
        source.push_str(&format!("slider P{i} 1\n"));
    }
    let mut harness = RtHarness::new(4, 1 << 20);
    harness.publish(1, &source);

    let mut host = UnitInputs::new(1, 64)
        .audio(vec![0.5; 64])
        .audio(vec![0.25; 64]);
    for i in 0..64 {
        host = host.param(i as f32, 1.0);
    }
    let channels = host.channels();
    let inputs = views(&channels);
    let mut unit = harness.unit(&inputs, 2);
    assert_eq!(unit.bound_params(), 64);

    let mut left = vec![0.0f32; 64];
    let mut right = vec![0.0f32; 64];
    let mut outputs: Vec<&mut [f32]> = vec![left.as_mut_slice(), right.as_mut_slice()];
    let start = Instant::now();
    for _ in 0..1000 {
        unit.process(64, &inputs, &mut outputs);
    }
    let duration = start.elapsed();
    // Assert bounded: less than 1 second for 1000 blocks
    assert!(duration.as_millis() < 1000, "Execution took too long: {:?}", duration);
    drop(outputs);
    harness.teardown(unit);
}
