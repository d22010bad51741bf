//! Test harness: a scripted stand-in compiler and a single-threaded host.
//!
//! [`ScriptCompiler`] understands a one-directive-per-line language, enough
//! to exercise every control kind and every failure path:
//!
//! ```text
//! inputs 1          # audio inputs read by compute
//! outputs 2         # audio outputs written by compute
//! vgroup Main       # hgroup / tgroup / vgroup open a box, close ends it
//! slider Gain 0.5   # vertical slider, optional init
//! hslider Pan
//! button Trig
//! checkbutton Bypass
//! nentry Steps
//! bargraph Level
//! soundfile Sample
//! close
//! error <message>   # compile fails with <message>
//! noinstance        # factory compiles but never creates instances
//! maxinstances 2    # factory creates at most 2 instances over its lifetime
//! panic             # compute panics
//! ```
//!
//! Every output sample is `input * product(addressable params)`, where the
//! input is `1.0` for programs without inputs and output `c` reads input
//! `c % inputs` otherwise.

use crate::compiler::{CompiledProgram, DspCompiler, DspFactory, DspInstance, ProgramName};
use crate::invariant_rt::{drain_invariant_signals, new_invariant_queue};
use crate::pipeline::{
    run_inline, CompileJob, CompileRequest, CompilerSettings, JobOutcome, NrtContext,
};
use crate::pool::{RtLease, RtPool};
use crate::registry::{ProgramKey, Reclaimer, Registry, Release};
use crate::surface::{BoxKind, Control, ControlRange, ParamZone, UiVisitor};
use crate::unit::{ProcessingUnit, UnitContext};
use rtrb::{Consumer, Producer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlKind {
    Button,
    CheckButton,
    VerticalSlider,
    HorizontalSlider,
    NumEntry,
    Bargraph,
    Soundfile,
}

impl ControlKind {
    fn addressable(self) -> bool {
        matches!(
            self,
            ControlKind::Button | ControlKind::VerticalSlider | ControlKind::HorizontalSlider
        )
    }
}

#[derive(Debug, Clone)]
enum Decl {
    Open(BoxKind, String),
    Close,
    Control {
        kind: ControlKind,
        label: String,
        init: f32,
    },
}

#[derive(Debug, Clone, Default)]
struct Script {
    inputs: usize,
    outputs: usize,
    decls: Vec<Decl>,
    no_instance: bool,
    max_instances: Option<usize>,
    panics: bool,
}

fn parse(source: &str) -> Result<Script, String> {
    let mut script = Script::default();
    for (number, raw) in source.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let control = |kind| -> Result<Decl, String> {
            let mut parts = rest.split_whitespace();
            let label = parts
                .next()
                .ok_or_else(|| format!("line {}: {} needs a label", number + 1, word))?;
            let init = match parts.next() {
                Some(text) => text
                    .parse()
                    .map_err(|_| format!("line {}: bad init {:?}", number + 1, text))?,
                None => 1.0,
            };
            Ok(Decl::Control {
                kind,
                label: label.to_owned(),
                init,
            })
        };
        match word {
            "inputs" | "outputs" => {
                let count = rest
                    .parse()
                    .map_err(|_| format!("line {}: bad channel count {:?}", number + 1, rest))?;
                if word == "inputs" {
                    script.inputs = count;
                } else {
                    script.outputs = count;
                }
            }
            "vgroup" => script.decls.push(Decl::Open(BoxKind::Vertical, rest.to_owned())),
            "hgroup" => script.decls.push(Decl::Open(BoxKind::Horizontal, rest.to_owned())),
            "tgroup" => script.decls.push(Decl::Open(BoxKind::Tab, rest.to_owned())),
            "close" => script.decls.push(Decl::Close),
            "slider" => script.decls.push(control(ControlKind::VerticalSlider)?),
            "hslider" => script.decls.push(control(ControlKind::HorizontalSlider)?),
            "button" => script.decls.push(control(ControlKind::Button)?),
            "checkbutton" => script.decls.push(control(ControlKind::CheckButton)?),
            "nentry" => script.decls.push(control(ControlKind::NumEntry)?),
            "bargraph" => script.decls.push(control(ControlKind::Bargraph)?),
            "soundfile" => script.decls.push(control(ControlKind::Soundfile)?),
            "noinstance" => script.no_instance = true,
            "maxinstances" => {
                let limit = rest
                    .parse()
                    .map_err(|_| format!("line {}: bad instance limit {:?}", number + 1, rest))?;
                script.max_instances = Some(limit);
            }
            "panic" => script.panics = true,
            "error" => return Err(rest.to_owned()),
            other => return Err(format!("line {}: unknown directive {:?}", number + 1, other)),
        }
    }
    Ok(script)
}

#[derive(Debug, Default)]
struct Counters {
    live_factories: AtomicUsize,
    live_instances: AtomicUsize,
    compile_calls: AtomicUsize,
    names: Mutex<Vec<String>>,
    args: Mutex<Vec<Vec<String>>>,
}

/// Scripted compiler. Clones share their counters.
#[derive(Debug, Clone, Default)]
pub struct ScriptCompiler {
    counters: Arc<Counters>,
}

impl ScriptCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factories currently alive.
    pub fn live_factories(&self) -> usize {
        self.counters.live_factories.load(Ordering::SeqCst)
    }

    /// Instances currently alive: introspection instances and the ones
    /// held in prepared unit slots.
    pub fn live_instances(&self) -> usize {
        self.counters.live_instances.load(Ordering::SeqCst)
    }

    pub fn compile_calls(&self) -> usize {
        self.counters.compile_calls.load(Ordering::SeqCst)
    }

    /// Every name passed to `compile`, in call order.
    pub fn compiled_names(&self) -> Vec<String> {
        self.counters
            .names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Flags passed to the most recent `compile`.
    pub fn last_args(&self) -> Option<Vec<String>> {
        self.counters
            .args
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last()
            .cloned()
    }

    /// Compile `source` under a fresh name, panicking on failure.
    pub fn program(&self, source: &str) -> CompiledProgram {
        let name = ProgramName::next();
        let factory = self
            .compile(&name.to_string(), source, &[], "")
            .unwrap_or_else(|message| panic!("script failed to compile: {message}"));
        CompiledProgram::new(name, factory)
    }
}

impl DspCompiler for ScriptCompiler {
    fn compile(
        &self,
        name: &str,
        source: &str,
        args: &[String],
        _target: &str,
    ) -> Result<Box<dyn DspFactory>, String> {
        self.counters.compile_calls.fetch_add(1, Ordering::SeqCst);
        self.counters
            .names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(name.to_owned());
        self.counters
            .args
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(args.to_vec());
        let script = parse(source)?;
        self.counters.live_factories.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptFactory {
            name: name.to_owned(),
            script: Arc::new(script),
            pool: None,
            created: AtomicUsize::new(0),
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct ScriptFactory {
    name: String,
    script: Arc<Script>,
    pool: Option<Arc<RtPool>>,
    created: AtomicUsize,
    counters: Arc<Counters>,
}

impl DspFactory for ScriptFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_instance(&self) -> Option<Box<dyn DspInstance>> {
        if self.script.no_instance {
            return None;
        }
        if let Some(limit) = self.script.max_instances {
            if self.created.load(Ordering::SeqCst) >= limit {
                return None;
            }
        }
        let cells = self
            .script
            .decls
            .iter()
            .filter(|decl| matches!(decl, Decl::Control { .. }))
            .count();
        let lease = match &self.pool {
            Some(pool) => Some(pool.lease_array::<ParamZone>(cells).ok()?),
            None => None,
        };
        let zones = self
            .script
            .decls
            .iter()
            .filter_map(|decl| match decl {
                Decl::Control { kind, init, .. } => Some((*kind, *init, ParamZone::new(*init))),
                _ => None,
            })
            .collect();
        self.created.fetch_add(1, Ordering::SeqCst);
        self.counters.live_instances.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(ScriptInstance {
            script: Arc::clone(&self.script),
            zones,
            sample_rate: 0,
            counters: Arc::clone(&self.counters),
            _lease: lease,
        }))
    }

    fn set_memory_manager(&mut self, pool: Arc<RtPool>) {
        self.pool = Some(pool);
    }
}

impl Drop for ScriptFactory {
    fn drop(&mut self) {
        self.counters.live_factories.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScriptInstance {
    script: Arc<Script>,
    zones: Vec<(ControlKind, f32, ParamZone)>,
    sample_rate: u32,
    counters: Arc<Counters>,
    _lease: Option<RtLease>,
}

impl ScriptInstance {
    fn gain(&self) -> f32 {
        self.zones
            .iter()
            .filter(|(kind, _, _)| kind.addressable())
            .map(|(_, _, zone)| zone.get())
            .product()
    }
}

impl DspInstance for ScriptInstance {
    fn num_inputs(&self) -> usize {
        self.script.inputs
    }

    fn num_outputs(&self) -> usize {
        self.script.outputs
    }

    fn init(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
        for (_, init, zone) in &self.zones {
            zone.set(*init);
        }
    }

    fn build_user_interface(&self, ui: &mut dyn UiVisitor) {
        let range = |init| ControlRange {
            init,
            min: 0.0,
            max: 1.0,
            step: 0.01,
        };
        let mut zones = self.zones.iter();
        for decl in &self.script.decls {
            match decl {
                Decl::Open(kind, label) => ui.open_box(*kind, label),
                Decl::Close => ui.close_box(),
                Decl::Control { kind, label, init } => {
                    let Some((_, _, zone)) = zones.next() else {
                        return;
                    };
                    let label = label.as_str();
                    let control = match kind {
                        ControlKind::Button => Control::Button { label, zone },
                        ControlKind::CheckButton => Control::CheckButton { label, zone },
                        ControlKind::VerticalSlider => Control::VerticalSlider {
                            label,
                            zone,
                            range: range(*init),
                        },
                        ControlKind::HorizontalSlider => Control::HorizontalSlider {
                            label,
                            zone,
                            range: range(*init),
                        },
                        ControlKind::NumEntry => Control::NumEntry {
                            label,
                            zone,
                            range: range(*init),
                        },
                        ControlKind::Bargraph => Control::VerticalBargraph {
                            label,
                            zone,
                            min: 0.0,
                            max: 1.0,
                        },
                        ControlKind::Soundfile => Control::Soundfile {
                            label,
                            filename: "",
                        },
                    };
                    ui.control(control);
                }
            }
        }
    }

    fn compute(&mut self, frames: usize, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) {
        if self.script.panics {
            panic!("scripted panic");
        }
        let gain = self.gain();
        for (channel, output) in outputs.iter_mut().enumerate() {
            let input = (!inputs.is_empty()).then(|| inputs[channel % inputs.len()]);
            for (frame, sample) in output[..frames].iter_mut().enumerate() {
                let x = input.map_or(1.0, |input| input[frame]);
                *sample = x * gain;
            }
        }
    }
}

impl Drop for ScriptInstance {
    fn drop(&mut self) {
        self.counters.live_instances.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Host-side input channels for one unit.
#[derive(Debug, Clone)]
pub struct UnitInputs {
    key: ProgramKey,
    frames: usize,
    audio: Vec<Vec<f32>>,
    params: Vec<(f32, f32)>,
}

impl UnitInputs {
    pub fn new(key: ProgramKey, frames: usize) -> Self {
        Self {
            key,
            frames,
            audio: Vec::new(),
            params: Vec::new(),
        }
    }

    /// Append an audio input. Shorter buffers are padded with zeros.
    pub fn audio(mut self, mut samples: Vec<f32>) -> Self {
        samples.resize(self.frames, 0.0);
        self.audio.push(samples);
        self
    }

    /// Append a (position, value) pair.
    pub fn param(mut self, position: f32, value: f32) -> Self {
        self.params.push((position, value));
        self
    }

    pub fn set_param_value(&mut self, pair: usize, value: f32) {
        if let Some(param) = self.params.get_mut(pair) {
            param.1 = value;
        }
    }

    /// Channels in host order, every one `frames` long.
    pub fn channels(&self) -> Vec<Vec<f32>> {
        let constant = |value: f32| vec![value; self.frames.max(1)];
        let mut channels = vec![
            constant(self.key as f32),
            constant(self.audio.len() as f32),
            constant(self.params.len() as f32),
        ];
        channels.extend(self.audio.iter().cloned());
        for &(position, value) in &self.params {
            channels.push(constant(position));
            channels.push(constant(value));
        }
        channels
    }
}

/// Borrow every channel as a slice.
pub fn views(channels: &[Vec<f32>]) -> Vec<&[f32]> {
    channels.iter().map(Vec::as_slice).collect()
}

/// Single-threaded host: runs every stage inline on the calling thread.
pub struct RtHarness {
    pub compiler: ScriptCompiler,
    pub settings: CompilerSettings,
    pub pool: Arc<RtPool>,
    pub registry: Registry,
    pub reclaimer: Reclaimer,
    pub sample_rate: u32,
    signal_tx: Producer<u8>,
    signal_rx: Consumer<u8>,
}

impl RtHarness {
    pub fn new(registry_capacity: usize, pool_bytes: usize) -> Self {
        let (registry, reclaimer) = Registry::new(registry_capacity);
        let (signal_tx, signal_rx) = new_invariant_queue();
        Self {
            compiler: ScriptCompiler::new(),
            settings: CompilerSettings::default(),
            pool: RtPool::new(pool_bytes),
            registry,
            reclaimer,
            sample_rate: 48_000,
            signal_tx,
            signal_rx,
        }
    }

    /// Compile and publish `source` under `key`.
    pub fn publish(&mut self, key: ProgramKey, source: &str) -> JobOutcome {
        self.run(CompileRequest::new(key, "", source))
    }

    /// Run a request through all four stages.
    pub fn run(&mut self, request: CompileRequest) -> JobOutcome {
        let job = CompileJob::new(request, self.sample_rate, &self.pool)
            .unwrap_or_else(|err| panic!("job did not fit the pool: {err}"));
        let ctx = NrtContext {
            compiler: &self.compiler,
            settings: &self.settings,
            pool: &self.pool,
        };
        run_inline(job, &ctx, &mut self.registry, &mut self.signal_tx)
    }

    pub fn unit(&mut self, inputs: &[&[f32]], num_outputs: usize) -> ProcessingUnit {
        let mut ctx = UnitContext {
            registry: &mut self.registry,
            sample_rate: self.sample_rate,
            signals: &mut self.signal_tx,
        };
        ProcessingUnit::new(&mut ctx, inputs, num_outputs)
    }

    pub fn teardown(&mut self, unit: ProcessingUnit) -> Option<Release> {
        unit.teardown(&mut self.registry, &mut self.signal_tx)
    }

    pub fn signal_tx(&mut self) -> &mut Producer<u8> {
        &mut self.signal_tx
    }

    /// Drain the RT signals emitted so far.
    pub fn signals(&mut self) -> Vec<u8> {
        drain_invariant_signals(&mut self.signal_rx)
    }
}
