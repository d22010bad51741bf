use dspswap::harness::{views, RtHarness, ScriptCompiler, UnitInputs};
use dspswap::invariant_rt::new_invariant_queue;
use dspswap::pipeline::{CompileJob, CompileRequest, CompilerSettings, JobStatus, NrtContext};
use dspswap::pool::RtPool;
use dspswap::registry::Registry;
use dspswap::unit::process_safe;
use std::alloc::{GlobalAlloc, Layout};
use std::cell::RefCell;

thread_local! {
    static ALLOC_COUNT: RefCell<usize> = const { RefCell::new(0) };
}

struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _ = ALLOC_COUNT.try_with(|c| *c.borrow_mut() += 1);
        unsafe { std::alloc::System.alloc(layout) }
    }
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let _ = ALLOC_COUNT.try_with(|c| *c.borrow_mut() += 1);
        unsafe { std::alloc::System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static A: CountingAllocator = CountingAllocator;

fn count() -> usize {
    ALLOC_COUNT.with(|c| *c.borrow())
}

#[test]
fn rt_alloc_invariant_process() {
    let mut harness = RtHarness::new(4, 1 << 20);
    harness.publish(1, "inputs 1\noutputs 2\nslider Gain\nhslider Pan\n");
    let channels = UnitInputs::new(1, 64)
        .audio(vec![0.5; 64])
        .param(0.0, 0.8)
        .param(1.0, 0.5)
        .channels();
    let inputs = views(&channels);
    let mut unit = harness.unit(&inputs, 2);
    assert!(unit.is_ready());
    let mut left = vec![0.0f32; 64];
    let mut right = vec![0.0f32; 64];
    let mut outputs: Vec<&mut [f32]> = vec![left.as_mut_slice(), right.as_mut_slice()];

    let before = count();
    for _ in 0..10_000 {
        process_safe(&mut unit, 64, &inputs, &mut outputs, harness.signal_tx());
    }
    let after = count();
    assert_eq!(after, before, "RT block processing should not allocate");

    drop(outputs);
    assert!(left.iter().all(|&s| s == 0.5 * 0.8 * 0.5));
    harness.signals();
    harness.teardown(unit);
}

#[test]
fn rt_alloc_invariant_inert_process() {
    let mut harness = RtHarness::new(4, 1 << 20);
    let channels = UnitInputs::new(42, 64).channels();
    let inputs = views(&channels);
    let mut unit = harness.unit(&inputs, 1);
    let mut out = vec![1.0f32; 64];
    let mut outputs: Vec<&mut [f32]> = vec![out.as_mut_slice()];

    let before = count();
    for _ in 0..10_000 {
        unit.process(64, &inputs, &mut outputs);
    }
    assert_eq!(count(), before, "inert units should not allocate");
}

#[test]
fn rt_alloc_invariant_registry_refcounting() {
    let mut harness = RtHarness::new(16, 1 << 20);
    for key in 0..8 {
        harness.publish(key, "outputs 1\n");
    }

    let before = count();
    for round in 0..1_000 {
        let key = round % 8;
        if let Some(id) = harness.registry.find(key) {
            harness.registry.acquire(id).unwrap();
            harness.registry.release(id).unwrap();
        }
    }
    assert_eq!(count(), before, "registry lookups and ref counting should not allocate");
}

#[test]
fn rt_alloc_invariant_deferred_delete() {
    let mut harness = RtHarness::new(4, 1 << 20);
    let outcome = harness.publish(1, "outputs 1\n");
    let id = outcome.entry().unwrap();
    harness.registry.acquire(id).unwrap();

    // Retiring the program on the RT side moves it into the retire queue;
    // nothing is freed until the reclaimer runs.
    let before = count();
    harness.registry.request_delete(1);
    harness.registry.release(id).unwrap();
    assert_eq!(count(), before, "deferred deletion should not touch the allocator");

    assert_eq!(harness.reclaimer.collect(), 1);
}

#[test]
fn rt_alloc_invariant_unit_lifecycle() {
    let mut harness = RtHarness::new(4, 1 << 20);
    harness.publish(7, "outputs 1\nslider Gain\nslider Tone\n");
    let channels = UnitInputs::new(7, 64)
        .param(0.0, 0.5)
        .param(1.0, 0.25)
        .channels();
    let inputs = views(&channels);
    let unknown = UnitInputs::new(8, 64).channels();
    let unknown_inputs = views(&unknown);

    let before = count();
    for _ in 0..100 {
        let unit = harness.unit(&inputs, 1);
        assert!(unit.is_ready());
        assert_eq!(unit.bound_params(), 2);
        harness.teardown(unit);
        let inert = harness.unit(&unknown_inputs, 1);
        assert!(inert.inert_reason().is_some());
        harness.teardown(inert);
    }
    let after = count();
    assert_eq!(after, before, "unit construction and teardown should not allocate");
    harness.signals();
}

#[test]
fn rt_alloc_invariant_swap_and_finish() {
    let compiler = ScriptCompiler::new();
    let settings = CompilerSettings::default();
    let pool = RtPool::new(1 << 20);
    let ctx = NrtContext {
        compiler: &compiler,
        settings: &settings,
        pool: &pool,
    };
    let (mut registry, mut reclaimer) = Registry::new(1);
    let (mut tx, _rx) = new_invariant_queue();

    // Published, then refused by the now full registry.
    for expect_published in [true, false] {
        let request = CompileRequest::new(1, "", "outputs 1\nslider Gain\n");
        let mut job = CompileJob::new(request, 48_000, &pool).unwrap();
        assert!(job.compile(&ctx));

        let before = count();
        job.swap(&mut registry, &mut tx);
        assert_eq!(count(), before, "stage 2 should not allocate");

        job.cleanup_nrt();

        let before = count();
        let outcome = job.finish(&mut tx);
        assert_eq!(count(), before, "stage 4 should not allocate");

        assert_eq!(outcome.is_published(), expect_published);
        if !expect_published {
            assert!(matches!(outcome.status, JobStatus::RegistryFull));
        }
    }

    registry.request_delete_all();
    assert_eq!(reclaimer.collect(), 1);
}
