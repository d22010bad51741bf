use dspswap::config::EngineConfig;
use dspswap::harness::{views, ScriptCompiler, UnitInputs};
use dspswap::host::{launch, Client, Command, Server, SubmitError};
use dspswap::pipeline::{CompileRequest, JobOutcome, JobStatus};
use dspswap::registry::Release;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

fn engine(config: EngineConfig) -> (ScriptCompiler, Server, Client) {
    let compiler = ScriptCompiler::new();
    let (server, client) = launch(&config, Arc::new(compiler.clone())).unwrap();
    (compiler, server, client)
}

fn config() -> EngineConfig {
    EngineConfig {
        reclaim_interval_ms: 0,
        queue_capacity: 8,
        ..EngineConfig::default()
    }
}

/// Run the RT side between simulated blocks until `count` outcomes arrive.
fn wait_for_outcomes(server: &mut Server, client: &mut Client, count: usize) -> Vec<JobOutcome> {
    let start = Instant::now();
    let mut outcomes = Vec::new();
    while outcomes.len() < count {
        server.run_commands();
        outcomes.extend(client.poll_outcomes());
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for outcomes");
        thread::sleep(Duration::from_millis(1));
    }
    outcomes
}

fn wait_until(server: &mut Server, mut done: impl FnMut(&Server) -> bool) {
    let start = Instant::now();
    while !done(server) {
        server.run_commands();
        assert!(start.elapsed() < TIMEOUT, "timed out");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn compile_publish_and_run_across_threads() {
    let (_compiler, mut server, mut client) = engine(config());
    client
        .compile(CompileRequest::new(7, "", "outputs 1\nslider Gain 0.5\n"))
        .unwrap();
    let outcomes = wait_for_outcomes(&mut server, &mut client, 1);
    assert!(outcomes[0].is_published());
    let entry = server.registry().entry(outcomes[0].entry().unwrap()).unwrap();
    assert_eq!(entry.program().spare_slots(), config().units_per_program);

    let channels = UnitInputs::new(7, 64).channels();
    let inputs = views(&channels);
    let mut unit = server.create_unit(&inputs, 1);
    assert!(unit.is_ready());
    let mut out = vec![0.0f32; 64];
    {
        let mut outputs: [&mut [f32]; 1] = [&mut out];
        server.process(&mut unit, 64, &inputs, &mut outputs);
    }
    assert!(out.iter().all(|&s| s == 0.5));
    server.destroy_unit(unit);

    client.drain_signals();
    client.shutdown().unwrap();
}

#[test]
fn requests_finish_in_submission_order() {
    let (compiler, mut server, mut client) = engine(config());
    for key in 0..5 {
        client
            .compile(CompileRequest::new(key, "", "outputs 1\n"))
            .unwrap();
    }
    let outcomes = wait_for_outcomes(&mut server, &mut client, 5);
    let keys: Vec<_> = outcomes.iter().map(|o| o.key).collect();
    assert_eq!(keys, vec![0, 1, 2, 3, 4]);
    assert_eq!(server.registry().len(), 5);
    assert_eq!(compiler.compile_calls(), 5);
}

#[test]
fn compile_error_comes_back_as_outcome() {
    let (_compiler, mut server, mut client) = engine(config());
    client
        .compile(CompileRequest::new(1, "", "error undefined symbol\n"))
        .unwrap();
    let outcomes = wait_for_outcomes(&mut server, &mut client, 1);
    assert!(matches!(outcomes[0].status, JobStatus::CompileFailed(_)));
    assert!(server.registry().is_empty());
}

#[test]
fn library_path_command_reaches_the_compiler() {
    let (compiler, mut server, mut client) = engine(EngineConfig {
        include_paths: vec![PathBuf::from("/extra")],
        ..config()
    });
    client
        .submit(Command::SetLibraryPath(PathBuf::from("/usr/local/share/dsp")))
        .unwrap();
    client
        .submit(Command::Compile(CompileRequest::new(1, "", "outputs 1\n")))
        .unwrap();
    wait_for_outcomes(&mut server, &mut client, 1);
    assert_eq!(
        compiler.last_args().unwrap(),
        vec!["-I", "/usr/local/share/dsp", "-I", "/extra"]
    );
}

#[test]
fn free_is_deferred_until_unit_is_destroyed() {
    let (compiler, mut server, mut client) = engine(config());
    client
        .compile(CompileRequest::new(3, "", "outputs 1\n"))
        .unwrap();
    wait_for_outcomes(&mut server, &mut client, 1);

    let channels = UnitInputs::new(3, 64).channels();
    let inputs = views(&channels);
    let unit = server.create_unit(&inputs, 1);

    client.submit(Command::Free { key: 3 }).unwrap();
    server.run_commands();
    let id = unit.entry().unwrap();
    assert!(server.registry().entry(id).unwrap().pending_deletion());

    assert_eq!(server.destroy_unit(unit), Some(Release::Deleted));
    assert!(server.registry().is_empty());

    // The worker reclaims the retired program and its unit slots.
    let start = Instant::now();
    while compiler.live_factories() > 0 {
        assert!(start.elapsed() < TIMEOUT, "program was never reclaimed");
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(compiler.live_instances(), 0);
    assert_eq!(server.pool().in_use(), 0);
}

#[test]
fn free_all_clears_the_registry() {
    let (_compiler, mut server, mut client) = engine(config());
    for key in 0..3 {
        client
            .compile(CompileRequest::new(key, "", "outputs 1\n"))
            .unwrap();
    }
    wait_for_outcomes(&mut server, &mut client, 3);
    client.submit(Command::FreeAll).unwrap();
    wait_until(&mut server, |server| server.registry().is_empty());
}

#[test]
fn oversized_request_is_refused_at_submit() {
    let (_compiler, _server, mut client) = engine(EngineConfig {
        rt_pool_bytes: 64,
        ..config()
    });
    let err = client
        .compile(CompileRequest::new(1, "", "outputs 1\n".repeat(32)))
        .unwrap_err();
    assert!(matches!(err, SubmitError::OutOfMemory(_)));
}
