//! Services and layers: lookup, memoization, pre-flight checks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use effex::{Cause, DefectKind, Effect, Layer, LayerError, RunError, Runtime, RuntimeConfig, Schedule, Tag};

fn runtime() -> Runtime {
    effex::init_test_logging();
    Runtime::new(RuntimeConfig::default().num_workers(4)).expect("runtime")
}

#[derive(Debug)]
struct Config {
    url: String,
}

#[derive(Debug)]
struct Database {
    url: String,
}

trait Greeter: Send + Sync {
    fn greet(&self, who: &str) -> String;
}

struct English;

impl Greeter for English {
    fn greet(&self, who: &str) -> String {
        format!("hello {}", who)
    }
}

fn config_layer(tag: &Tag<Config>, builds: &Arc<AtomicUsize>, build_time: Duration) -> Layer<String> {
    let builds = Arc::clone(builds);
    let build = Effect::<(), String>::sync(move || {
        builds.fetch_add(1, Ordering::SeqCst);
    })
    .zip_right(Effect::<(), String>::sleep(build_time))
    .map(|_| {
        Arc::new(Config {
            url: "postgres://local".into(),
        })
    });
    Layer::effect(tag, build).named("ConfigLive")
}

fn database_layer(db: &Tag<Database>, config: &Tag<Config>) -> Layer<String> {
    let build = Effect::with_service(config, |cfg: Arc<Config>| {
        Effect::succeed(Arc::new(Database { url: cfg.url.clone() }))
    });
    Layer::effect(db, build).named("DatabaseLive")
}

#[test]
fn test_provide_service_value() {
    let greeter: Tag<dyn Greeter> = Tag::new("Greeter");
    let program: Effect<String, String> =
        Effect::with_service(&greeter, |g: Arc<dyn Greeter>| Effect::sync(move || g.greet("fibers")));
    let program = program.provide_service(&greeter, Arc::new(English) as Arc<dyn Greeter>);
    assert_eq!(runtime().run_blocking(program).unwrap(), Ok("hello fibers".to_string()));
}

#[test]
fn test_shared_dependency_built_once() {
    let (config, db, cache): (Tag<Config>, Tag<Database>, Tag<Database>) =
        (Tag::new("Config"), Tag::new("Database"), Tag::new("Cache"));
    let builds = Arc::new(AtomicUsize::new(0));

    let config_live = config_layer(&config, &builds, Duration::ZERO);
    let app = database_layer(&db, &config)
        .merge(&database_layer(&cache, &config))
        .provide(&config_live);

    let program: Effect<String, String> = Effect::with_service(&db, move |d: Arc<Database>| {
        Effect::with_service(&cache, move |c: Arc<Database>| {
            let joined = format!("{} {}", d.url, c.url);
            Effect::sync(move || joined.clone())
        })
    })
    .provide(&app);

    let exit = runtime().run_blocking(program).unwrap();
    assert_eq!(exit, Ok("postgres://local postgres://local".to_string()));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_branches_share_build() {
    let config: Tag<Config> = Tag::new("Config");
    let builds = Arc::new(AtomicUsize::new(0));
    let live = config_layer(&config, &builds, Duration::from_millis(20));

    let branch = || {
        Effect::<Arc<Config>, String>::service(&config)
            .map(|cfg| cfg.url.len())
            .provide(&live)
    };
    let program = Effect::all(vec![branch(), branch(), branch()]);

    assert_eq!(runtime().run_blocking(program).unwrap(), Ok(vec![16, 16, 16]));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[test]
fn test_layer_failure_is_typed() {
    let rt = runtime();
    let config: Tag<Config> = Tag::new("Config");
    let broken: Layer<String> = Layer::effect(&config, Effect::fail("CONFIG_URL not set".to_string()));
    let program = Effect::<Arc<Config>, String>::service(&config).map(|c| c.url.clone());

    let failed = program.clone().provide(&broken);
    assert_eq!(
        rt.run_blocking(failed).unwrap(),
        Err(Cause::Fail("CONFIG_URL not set".to_string()))
    );

    let recovered = program.provide(&broken).catch_all(|e: String| Effect::<String, String>::succeed(e));
    assert_eq!(rt.run_blocking(recovered).unwrap(), Ok("CONFIG_URL not set".to_string()));
}

#[test]
fn test_layer_map_error() {
    let config: Tag<Config> = Tag::new("Config");
    let broken: Layer<String> = Layer::effect(&config, Effect::fail("four".to_string()));
    let mapped: Layer<usize> = broken.map_error(|e| e.len());
    let program = Effect::<Arc<Config>, usize>::service(&config).as_unit().provide(&mapped);
    assert_eq!(runtime().run_blocking(program).unwrap(), Err(Cause::Fail(4)));
}

#[test]
fn test_missing_service_rejected_before_run() {
    let rt = runtime();
    let config: Tag<Config> = Tag::new("Config");
    let touched = Arc::new(AtomicUsize::new(0));
    let t = Arc::clone(&touched);
    let program = Effect::<(), String>::sync(move || {
        t.fetch_add(1, Ordering::SeqCst);
    })
    .zip_right(Effect::<Arc<Config>, String>::service(&config));

    match rt.run(program) {
        Err(RunError::MissingServices { services }) => assert_eq!(services, vec!["Config"]),
        other => panic!("expected missing services, got {:?}", other.map(|_| ())),
    }
    assert_eq!(touched.load(Ordering::SeqCst), 0);
}

#[test]
fn test_hidden_dependency_is_not_exported() {
    let (config, db): (Tag<Config>, Tag<Database>) = (Tag::new("Config"), Tag::new("Database"));
    let builds = Arc::new(AtomicUsize::new(0));
    let app = database_layer(&db, &config).provide(&config_layer(&config, &builds, Duration::ZERO));

    let program = Effect::<Arc<Database>, String>::service(&db)
        .zip_right(Effect::<Arc<Config>, String>::service(&config))
        .provide(&app);

    match runtime().run(program) {
        Err(RunError::MissingServices { services }) => assert_eq!(services, vec!["Config"]),
        other => panic!("expected missing services, got {:?}", other.map(|_| ())),
    }
}

fn cyclic_layers() -> (Tag<Config>, Layer<String>) {
    let (config, db): (Tag<Config>, Tag<Database>) = (Tag::new("Config"), Tag::new("Database"));
    let needs_db = Effect::with_service(&db, |d: Arc<Database>| {
        Effect::succeed(Arc::new(Config { url: d.url.clone() }))
    });
    let config_live = Layer::effect(&config, needs_db).named("ConfigFromDb");
    (config, config_live.merge(&database_layer(&db, &config)))
}

#[test]
fn test_cycle_rejected_before_run() {
    let (config, cyclic) = cyclic_layers();
    let program = Effect::<Arc<Config>, String>::service(&config).provide(&cyclic);
    match runtime().run(program) {
        Err(RunError::Layer(LayerError::Cycle { layers })) => assert_eq!(layers.len(), 2),
        other => panic!("expected a cycle, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_cycle_behind_continuation_is_defect() {
    let (config, cyclic) = cyclic_layers();
    let inner = Effect::<Arc<Config>, String>::service(&config).as_unit().provide(&cyclic);
    let program = Effect::<(), String>::unit().flat_map(move |_| inner.clone());

    let exit = runtime().run_blocking(program).unwrap();
    assert_eq!(exit.unwrap_err().defect().map(|d| d.kind()), Some(DefectKind::Layer));
}

#[test]
fn test_duplicate_service_rejected() {
    let config: Tag<Config> = Tag::new("Config");
    let a: Layer<String> = Layer::succeed(&config, Arc::new(Config { url: "a".into() }));
    let b: Layer<String> = Layer::succeed(&config, Arc::new(Config { url: "b".into() }));
    let program = Effect::<Arc<Config>, String>::service(&config).provide(&a.merge(&b));

    match runtime().run(program) {
        Err(RunError::Layer(LayerError::DuplicateService { service, .. })) => assert_eq!(service, "Config"),
        other => panic!("expected duplicate service, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_interrupted_build_is_rebuilt() {
    let config: Tag<Config> = Tag::new("Config");
    let builds = Arc::new(AtomicUsize::new(0));
    let live = config_layer(&config, &builds, Duration::from_millis(50));

    let use_config = Effect::<Arc<Config>, String>::service(&config)
        .map(|c| c.url.len())
        .provide(&live);
    let fallback = Effect::<(), String>::sleep(Duration::from_millis(5)).zip_right(Effect::succeed(0usize));

    let program = use_config
        .clone()
        .race(fallback)
        .flat_map(move |first| use_config.clone().map(move |second| (first, second)))
        .flat_map({
            let again = Effect::<Arc<Config>, String>::service(&config)
                .map(|c| c.url.len())
                .provide(&live);
            move |pair| again.clone().map(move |_| pair)
        });

    assert_eq!(runtime().run_blocking(program).unwrap(), Ok((0, 16)));
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

#[test]
fn test_provide_merge_exports_both() {
    let (config, db): (Tag<Config>, Tag<Database>) = (Tag::new("Config"), Tag::new("Database"));
    let builds = Arc::new(AtomicUsize::new(0));
    let app = database_layer(&db, &config).provide_merge(&config_layer(&config, &builds, Duration::ZERO));

    let program = Effect::<effex::Context, String>::context()
        .map(move |ctx| (ctx.get(&config).is_some(), ctx.get(&db).is_some(), ctx.len()))
        .requires(&config)
        .requires(&db)
        .provide(&app);
    assert_eq!(runtime().run_blocking(program).unwrap(), Ok((true, true, 2)));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[test]
fn test_declared_requirement_checked() {
    let config: Tag<Config> = Tag::new("Config");
    let program = Effect::<(), String>::unit().requires(&config);
    assert!(matches!(
        runtime().run(program),
        Err(RunError::MissingServices { ref services }) if services == &vec!["Config"]
    ));
}

#[test]
fn test_failed_build_is_rebuilt_on_retry() {
    let config: Tag<Config> = Tag::new("Config");
    let builds = Arc::new(AtomicUsize::new(0));
    let b = Arc::clone(&builds);
    let flaky: Layer<String> = Layer::effect(
        &config,
        Effect::try_sync(
            move || match b.fetch_add(1, Ordering::SeqCst) {
                0 => Err("first build fails".to_string()),
                _ => Ok(Arc::new(Config { url: "pg".into() })),
            },
            |e: String| e,
        ),
    );

    let program = Effect::<Arc<Config>, String>::service(&config)
        .map(|c| c.url.len() + 5)
        .provide(&flaky)
        .retry(Schedule::recurs(3));
    assert_eq!(runtime().run_blocking(program).unwrap(), Ok(7));
    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

#[test]
fn test_waiters_share_a_failed_build() {
    let config: Tag<Config> = Tag::new("Config");
    let builds = Arc::new(AtomicUsize::new(0));
    let b = Arc::clone(&builds);
    let down: Layer<String> = Layer::effect(
        &config,
        Effect::<(), String>::sync(move || {
            b.fetch_add(1, Ordering::SeqCst);
        })
        .zip_right(Effect::<(), String>::sleep(Duration::from_millis(20)))
        .zip_right(Effect::<Arc<Config>, String>::fail("down".to_string())),
    );

    let branch = || {
        Effect::<Arc<Config>, String>::service(&config)
            .map(|c| c.url.len())
            .provide(&down)
    };
    let program = Effect::all(vec![branch(), branch(), branch()]);
    assert_eq!(runtime().run_blocking(program).unwrap(), Err(Cause::Fail("down".to_string())));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}
