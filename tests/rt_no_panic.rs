use dspswap::harness::{views, RtHarness, UnitInputs};
use dspswap::invariant_rt::INV_BLOCK_PANICKED;
use dspswap::unit::process_safe;
use proptest::prelude::*;

#[test]
fn panicking_program_is_silenced() {
    let mut harness = RtHarness::new(4, 1 << 20);
    harness.publish(1, "outputs 2\npanic\n");
    harness.signals();
    let channels = UnitInputs::new(1, 32).channels();
    let inputs = views(&channels);
    let mut unit = harness.unit(&inputs, 2);
    assert!(unit.is_ready());

    let mut left = vec![1.0f32; 32];
    let mut right = vec![1.0f32; 32];
    {
        let mut outputs: Vec<&mut [f32]> = vec![left.as_mut_slice(), right.as_mut_slice()];
        process_safe(&mut unit, 32, &inputs, &mut outputs, harness.signal_tx());
    }
    assert!(left.iter().chain(&right).all(|&s| s == 0.0));
    assert!(harness.signals().contains(&INV_BLOCK_PANICKED));
    harness.teardown(unit);
}

proptest! {
    #[test]
    fn arbitrary_headers_never_panic(
        header in prop::collection::vec(prop::num::f32::ANY, 0..12),
        outputs in 0usize..4,
        frames in 0usize..80,
    ) {
        let mut harness = RtHarness::new(4, 1 << 16);
        harness.publish(1, "inputs 1\noutputs 1\nslider Gain\n");
        harness.publish(2, "outputs 2\nslider A\nbutton B\n");

        let channels: Vec<Vec<f32>> = header.iter().map(|&v| vec![v; 64]).collect();
        let inputs = views(&channels);
        let mut unit = harness.unit(&inputs, outputs);

        let mut buffers = vec![vec![0.5f32; 64]; outputs];
        {
            let mut views_out: Vec<&mut [f32]> =
                buffers.iter_mut().map(Vec::as_mut_slice).collect();
            let ran = unit.process(frames, &inputs, &mut views_out);
            if !ran {
                let written = frames.min(64);
                for channel in &views_out {
                    prop_assert!(channel[..written].iter().all(|&s| s == 0.0));
                }
            }
        }
        harness.teardown(unit);
        prop_assert!(harness.registry.iter().all(|(_, entry)| entry.ref_count() == 0));
    }

    #[test]
    fn mismatched_block_buffers_never_panic(
        in_len in 0usize..80,
        out_len in 0usize..80,
        out_channels in 0usize..3,
        frames in 0usize..100,
    ) {
        let mut harness = RtHarness::new(4, 1 << 16);
        harness.publish(1, "inputs 1\noutputs 1\nslider Gain\n");
        let bind = UnitInputs::new(1, 64).audio(vec![1.0; 64]).param(0.0, 0.5).channels();
        let bind_views = views(&bind);
        let mut unit = harness.unit(&bind_views, 1);
        prop_assert!(unit.is_ready());

        // Blocks may arrive with other buffer sizes than at construction.
        let block: Vec<Vec<f32>> = bind.iter().map(|c| vec![c[0]; in_len]).collect();
        let block_views = views(&block);
        let mut buffers = vec![vec![0.0f32; out_len]; out_channels];
        let mut outs: Vec<&mut [f32]> = buffers.iter_mut().map(Vec::as_mut_slice).collect();
        unit.process(frames, &block_views, &mut outs);
        drop(outs);
        harness.teardown(unit);
    }
}
