#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowd::builtin::register_builtins;
use flowd::component::{Component, Handler, Health, Options, Request, RunContext};
use flowd::config::{Block, Loader};
use flowd::controller::{Controller, ControllerOptions, Lifecycle};
use flowd::registry::{Registration, Registry, Stability};
use flowd::value::Value;
use futures::future::BoxFuture;
use serde::Deserialize;
use tempfile::TempDir;

/// Something that happened to a recording unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Built(String, Value),
    Updated(String, Value),
    Stopped(String),
}

/// Shared log of the events of the recording units.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    /// Updates of `test.concurrent` units that have not been answered yet.
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    concurrent_updates: AtomicUsize,
}

impl Recorder {
    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Number of times that the unit `id` has been built.
    pub fn builds(&self, id: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Built(i, _) if i == id))
            .count()
    }

    /// Number of times that the unit `id` has been updated.
    pub fn updates(&self, id: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Updated(i, _) if i == id))
            .count()
    }

    /// Largest number of updates that a `test.concurrent` unit was handling at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of updates answered by the `test.concurrent` units.
    pub fn concurrent_updates(&self) -> usize {
        self.concurrent_updates.load(Ordering::SeqCst)
    }

    /// Ids of the stopped units, in order.
    pub fn stopped(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Stopped(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct RecordingArguments {
    #[serde(default)]
    input: Value,
}

/// `test.recorder`: records what happens to it and exports `{ input }`.
struct RecordingUnit {
    opts: Options,
    recorder: Arc<Recorder>,
}

impl Handler for RecordingUnit {
    fn update(&mut self, args: Value) -> anyhow::Result<()> {
        let input = args.get("input").cloned().unwrap_or_default();
        self.recorder.push(Event::Updated(self.opts.id.clone(), input.clone()));
        self.opts.publish(Value::object([("input", input)]));
        Ok(())
    }

    fn health(&self) -> Option<Health> {
        Some(Health::healthy("recording"))
    }
}

impl Component for RecordingUnit {
    fn run(mut self: Box<Self>, mut ctx: RunContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.serve(&mut *self).await?;
            self.recorder.push(Event::Stopped(self.opts.id.clone()));
            Ok(())
        })
    }
}

#[derive(Deserialize)]
struct NoArguments {}

#[derive(Deserialize)]
struct FailingArguments {
    fail: bool,
}

/// `test.failing`: its constructor and its updates fail when `fail` is true.
struct FailingUnit;

impl Handler for FailingUnit {
    fn update(&mut self, args: Value) -> anyhow::Result<()> {
        let args: FailingArguments = args.decode()?;
        anyhow::ensure!(!args.fail, "asked to fail");
        Ok(())
    }
}

impl Component for FailingUnit {
    fn run(mut self: Box<Self>, mut ctx: RunContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move { ctx.serve(&mut *self).await })
    }
}

#[derive(Deserialize)]
struct DeafArguments {
    #[serde(default)]
    tag: i64,
}

/// `test.deaf`: never answers its requests.
struct DeafUnit;

impl Component for DeafUnit {
    fn run(self: Box<Self>, ctx: RunContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.cancellation_token().cancelled().await;
            Ok(())
        })
    }
}

/// `test.stubborn`: never returns from its run method, even when cancelled.
struct StubbornUnit;

impl Component for StubbornUnit {
    fn run(self: Box<Self>, _ctx: RunContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(std::future::pending::<anyhow::Result<()>>())
    }
}

/// `test.concurrent`: answers each update on its own task, after a short delay.
///
/// Nothing in the unit prevents two updates from overlapping.
struct ConcurrentUnit {
    recorder: Arc<Recorder>,
}

impl Component for ConcurrentUnit {
    fn run(self: Box<Self>, mut ctx: RunContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            while let Some(req) = ctx.next_request().await {
                let Request::Update { response_tx, .. } = req else {
                    continue;
                };
                let recorder = Arc::clone(&self.recorder);
                tokio::spawn(async move {
                    let n = recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    recorder.max_in_flight.fetch_max(n, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
                    recorder.concurrent_updates.fetch_add(1, Ordering::SeqCst);
                    let _ = response_tx.send(Ok(()));
                });
            }
            Ok(())
        })
    }
}

/// Any arguments.
#[derive(Deserialize)]
struct AnyArguments {}

#[derive(Deserialize)]
struct SlowBuildArguments {
    delay_ms: u64,
}

/// A unit that accepts every update.
struct IdleUnit;

impl Handler for IdleUnit {
    fn update(&mut self, _args: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Component for IdleUnit {
    fn run(mut self: Box<Self>, mut ctx: RunContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move { ctx.serve(&mut *self).await })
    }
}

#[derive(Deserialize)]
struct FlakyArguments {
    #[serde(default)]
    input: Value,
    #[serde(default)]
    fail: bool,
    #[serde(default)]
    exit: bool,
}

/// `test.flaky`: exports `{ input }`. Its constructor fails when `fail` is true,
/// and its run method returns as soon as `exit` is true.
struct FlakyUnit {
    opts: Options,
    exit: bool,
}

impl Handler for FlakyUnit {
    fn update(&mut self, args: Value) -> anyhow::Result<()> {
        let args: FlakyArguments = args.decode()?;
        self.exit = args.exit;
        self.opts.publish(Value::object([("input", args.input)]));
        Ok(())
    }
}

impl Component for FlakyUnit {
    fn run(mut self: Box<Self>, mut ctx: RunContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            while !self.exit {
                let Some(req) = ctx.next_request().await else {
                    break;
                };
                req.handle(&mut *self);
            }
            Ok(())
        })
    }
}

/// Builds a registry with the builtin units and the test units.
pub fn registry(recorder: &Arc<Recorder>) -> Registry {
    let mut builder = Registry::builder();
    register_builtins(&mut builder);

    let rec = Arc::clone(recorder);
    builder.register(Registration::new::<RecordingArguments, Value, _, _>(
        "test.recorder",
        Stability::GenerallyAvailable,
        move |opts: Options, args: RecordingArguments| {
            rec.push(Event::Built(opts.id.clone(), args.input.clone()));
            opts.publish(Value::object([("input", args.input)]));
            Ok(RecordingUnit {
                opts,
                recorder: Arc::clone(&rec),
            })
        },
    ));
    builder.register(Registration::new::<FailingArguments, (), _, _>(
        "test.failing",
        Stability::GenerallyAvailable,
        |_opts: Options, args: FailingArguments| {
            anyhow::ensure!(!args.fail, "asked to fail");
            Ok(FailingUnit)
        },
    ));
    builder.register(Registration::new::<DeafArguments, (), _, _>(
        "test.deaf",
        Stability::GenerallyAvailable,
        |_opts: Options, _args: DeafArguments| Ok(DeafUnit),
    ));
    builder.register(Registration::new::<NoArguments, (), _, _>(
        "test.stubborn",
        Stability::GenerallyAvailable,
        |_opts: Options, _args: NoArguments| Ok(StubbornUnit),
    ));
    let rec = Arc::clone(recorder);
    builder.register(Registration::new::<AnyArguments, (), _, _>(
        "test.concurrent",
        Stability::GenerallyAvailable,
        move |_opts: Options, _args: AnyArguments| {
            Ok(ConcurrentUnit {
                recorder: Arc::clone(&rec),
            })
        },
    ));
    builder.register(Registration::new::<SlowBuildArguments, (), _, _>(
        "test.slow_build",
        Stability::GenerallyAvailable,
        |_opts: Options, args: SlowBuildArguments| {
            // factories run on the blocking pool
            std::thread::sleep(Duration::from_millis(args.delay_ms));
            Ok(IdleUnit)
        },
    ));
    builder.register(Registration::new::<FlakyArguments, Value, _, _>(
        "test.flaky",
        Stability::GenerallyAvailable,
        |opts: Options, args: FlakyArguments| {
            anyhow::ensure!(!args.fail, "asked to fail");
            opts.publish(Value::object([("input", args.input)]));
            Ok(FlakyUnit { opts, exit: args.exit })
        },
    ));
    builder.build()
}

/// A controller with the test registry.
pub struct TestController {
    pub controller: Controller,
    pub recorder: Arc<Recorder>,
    _data_dir: TempDir,
}

impl TestController {
    pub fn new() -> Self {
        Self::with_stability(Stability::GenerallyAvailable)
    }

    pub fn with_stability(min_stability: Stability) -> Self {
        Self::with_options(|options| options.min_stability = min_stability)
    }

    /// A controller whose options are adjusted by `configure`.
    pub fn with_options(configure: impl FnOnce(&mut ControllerOptions)) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let recorder = Arc::new(Recorder::default());
        let data_dir = tempfile::tempdir().unwrap();
        let mut options = ControllerOptions::new(Arc::new(registry(&recorder)));
        options.data_dir = data_dir.path().to_owned();
        options.shutdown_grace = Duration::from_secs(1);
        configure(&mut options);
        Self {
            controller: Controller::new(options),
            recorder,
            _data_dir: data_dir,
        }
    }

    /// Returns the exports of a node.
    pub async fn exports(&self, id: &str) -> Option<Value> {
        self.controller
            .node(id, Duration::from_secs(1))
            .await
            .unwrap_or_else(|e| panic!("node {id} not found: {e}"))
            .exports
    }

    /// Returns the lifecycle of a node, without asking its unit.
    pub fn lifecycle(&self, id: &str) -> Lifecycle {
        self.controller
            .list_nodes()
            .into_iter()
            .find(|n| n.id == id)
            .unwrap_or_else(|| panic!("node {id} not found"))
            .lifecycle
    }
}

/// Parses a pipeline configuration.
pub fn blocks(toml: &str) -> Vec<Block> {
    Loader::parse_str(toml).load().unwrap()
}

/// Polls `condition` until it is true, or panics after `timeout`.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met after {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
