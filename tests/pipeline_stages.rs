use dspswap::compiler::CompileError;
use dspswap::harness::{RtHarness, ScriptCompiler};
use dspswap::invariant_rt::{new_invariant_queue, INV_PUBLISH_FAILED, INV_SWAP_SKIPPED};
use dspswap::pipeline::{
    run_inline, CompileJob, CompileRequest, CompilerSettings, JobStatus, NrtContext, Stage,
};
use dspswap::pool::RtPool;
use dspswap::registry::Registry;
use std::path::PathBuf;

#[test]
fn identical_sources_get_distinct_names_and_entries() {
    let mut harness = RtHarness::new(4, 1 << 20);
    let first = harness.publish(1, "outputs 1\nslider Gain\n");
    let second = harness.publish(1, "outputs 1\nslider Gain\n");

    assert!(first.is_published() && second.is_published());
    assert_ne!(first.name, second.name);
    assert_ne!(first.entry(), second.entry());
    assert_eq!(harness.registry.len(), 2);
    assert_eq!(harness.registry.find(1), second.entry());

    let names = harness.compiler.compiled_names();
    assert_eq!(names.len(), 2);
    assert_ne!(names[0], names[1]);
}

#[test]
fn compile_failure_publishes_nothing_and_frees_the_job() {
    let mut harness = RtHarness::new(4, 1 << 20);
    let outcome = harness.publish(1, "outputs 1\nerror unknown identifier 'foo'\n");

    match &outcome.status {
        JobStatus::CompileFailed(CompileError::Rejected { message, .. }) => {
            assert_eq!(message, "unknown identifier 'foo'");
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert!(harness.registry.is_empty());
    assert_eq!(harness.pool.in_use(), 0);
    assert!(harness.signals().contains(&INV_SWAP_SKIPPED));
}

#[test]
fn factory_without_instance_is_a_compile_failure() {
    let mut harness = RtHarness::new(4, 1 << 20);
    let outcome = harness.publish(1, "outputs 1\nnoinstance\n");
    assert!(matches!(
        outcome.status,
        JobStatus::CompileFailed(CompileError::NoInstance { .. })
    ));
    assert!(harness.registry.is_empty());
    drop(outcome);
    assert_eq!(harness.compiler.live_factories(), 0);
}

#[test]
fn full_registry_is_recorded_and_program_cleaned_up() {
    let mut harness = RtHarness::new(1, 1 << 20);
    assert!(harness.publish(1, "outputs 1\n").is_published());

    let outcome = harness.publish(2, "outputs 1\n");
    assert!(matches!(outcome.status, JobStatus::RegistryFull));
    // Stage 3 dropped the unpublished program.
    assert!(!outcome.has_leftover_program());
    assert_eq!(harness.compiler.live_factories(), 1);
    assert_eq!(harness.registry.len(), 1);
    assert!(harness.signals().contains(&INV_PUBLISH_FAILED));
}

#[test]
fn introspection_instance_is_dropped_during_compile() {
    let mut harness = RtHarness::new(4, 1 << 20);
    harness.settings.units_per_program = 0;
    harness.publish(1, "outputs 2\nslider Gain\n");
    assert_eq!(harness.compiler.live_instances(), 0);
    assert_eq!(harness.compiler.live_factories(), 1);
}

#[test]
fn compile_prepares_unit_slots_on_the_pool() {
    let mut harness = RtHarness::new(4, 1 << 20);
    harness.settings.units_per_program = 3;
    let outcome = harness.publish(1, "outputs 1\nslider A\nslider B\n");
    let entry = harness.registry.entry(outcome.entry().unwrap()).unwrap();
    assert_eq!(entry.program().spare_slots(), 3);
    assert_eq!(entry.program().slot_capacity(), 3);
    assert!(!entry.program().instance_refused());
    assert_eq!(harness.compiler.live_instances(), 3);
    assert!(harness.pool.in_use() > 0);

    // The slots leave with the program and give their budget back.
    harness.registry.request_delete(1);
    assert_eq!(harness.reclaimer.collect(), 1);
    assert_eq!(harness.compiler.live_instances(), 0);
    assert_eq!(harness.compiler.live_factories(), 0);
    assert_eq!(harness.pool.in_use(), 0);
}

#[test]
fn instance_limit_stops_slot_preparation() {
    let mut harness = RtHarness::new(4, 1 << 20);
    // One instance goes to introspection, two to slots.
    let outcome = harness.publish(1, "outputs 1\nmaxinstances 3\n");
    let entry = harness.registry.entry(outcome.entry().unwrap()).unwrap();
    assert_eq!(entry.program().spare_slots(), 2);
    assert!(entry.program().instance_refused());
}

#[test]
fn shape_is_discovered_from_the_program() {
    let mut harness = RtHarness::new(4, 1 << 20);
    let outcome = harness.publish(1, "inputs 2\noutputs 3\nslider A\nbutton B\ncheckbutton C\n");
    let shape = outcome.shape().unwrap();
    assert_eq!(shape.input_count, 2);
    assert_eq!(shape.output_count, 3);
    assert_eq!(shape.param_count, 2);

    let entry = harness.registry.entry(outcome.entry().unwrap()).unwrap();
    assert_eq!(entry.output_count(), 3);
    assert_eq!(entry.param_count(), 2);
}

#[test]
fn stages_step_one_at_a_time() {
    let compiler = ScriptCompiler::new();
    let settings = CompilerSettings::default();
    let pool = RtPool::new(1 << 16);
    let ctx = NrtContext {
        compiler: &compiler,
        settings: &settings,
        pool: &pool,
    };
    let (mut registry, _reclaimer) = Registry::new(4);
    let (mut tx, _rx) = new_invariant_queue();

    let request = CompileRequest::new(9, "", "outputs 1\n");
    let mut job = CompileJob::new(request, 44_100, &pool).unwrap();
    let leased = job.leased_bytes();
    assert!(leased > 0);
    assert_eq!(pool.in_use(), leased);

    assert!(job.compile(&ctx));
    assert!(job.name().is_some());
    assert!(registry.is_empty());
    // Stage 1 adds the program's unit slots on top of the job buffers.
    let held = pool.in_use();
    assert!(held > leased);

    assert!(job.swap(&mut registry, &mut tx));
    assert_eq!(job.stage(), Stage::CleanupNrt);
    assert_eq!(registry.find(9), job.published());

    assert!(job.cleanup_nrt());
    assert_eq!(job.stage(), Stage::CleanupRt);
    // The buffers are still held until stage 4.
    assert_eq!(pool.in_use(), held);

    let outcome = job.finish(&mut tx);
    assert!(outcome.is_published());
    assert_eq!(pool.in_use(), held - leased);
}

#[test]
fn library_path_comes_before_include_paths() {
    let compiler = ScriptCompiler::new();
    let settings = CompilerSettings {
        library_path: Some(PathBuf::from("/opt/dsp/lib")),
        include_paths: vec![PathBuf::from("/home/user/dsp")],
        target: "x86_64-unknown-linux-gnu".into(),
        ..CompilerSettings::default()
    };
    let pool = RtPool::new(1 << 16);
    let ctx = NrtContext {
        compiler: &compiler,
        settings: &settings,
        pool: &pool,
    };
    let (mut registry, _reclaimer) = Registry::new(4);
    let (mut tx, _rx) = new_invariant_queue();
    let job = CompileJob::new(CompileRequest::new(1, "", "outputs 1\n"), 48_000, &pool).unwrap();
    run_inline(job, &ctx, &mut registry, &mut tx);

    assert_eq!(
        compiler.last_args().unwrap(),
        vec!["-I", "/opt/dsp/lib", "-I", "/home/user/dsp"]
    );
}

#[test]
fn published_factory_allocates_from_the_rt_pool() {
    let mut harness = RtHarness::new(4, 1 << 20);
    let outcome = harness.publish(1, "outputs 1\nslider A\nslider B\n");
    let entry = harness.registry.entry(outcome.entry().unwrap()).unwrap();
    let before = harness.pool.in_use();
    let instance = entry.program().create_instance().unwrap();
    assert!(harness.pool.in_use() > before);
    drop(instance);
    assert_eq!(harness.pool.in_use(), before);
}
