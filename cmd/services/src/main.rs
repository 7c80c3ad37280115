//! Services and layers example
//!
//! A repository service built from a config layer, both provided to the
//! program through one composed layer. Missing services are rejected before
//! the program starts; domain failures are recovered by tag.
//!
//! # Environment Variables
//!
//! - `EFFEX_LOG=debug` - Log filter directives
//! - `APP_DB_URL` - Connection string reported by the config service

use std::collections::HashMap;
use std::sync::Arc;

use effex::{Effect, Layer, Tag, Tagged};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
enum RepoError {
    #[error("user {0} not found")]
    NotFound(u32),
    #[error("config error: {0}")]
    Config(String),
}

impl Tagged for RepoError {
    fn tag(&self) -> &'static str {
        match self {
            RepoError::NotFound(_) => "NotFound",
            RepoError::Config(_) => "Config",
        }
    }
}

struct AppConfig {
    db_url: String,
}

trait UserRepo: Send + Sync {
    fn find(&self, id: u32) -> Effect<String, RepoError>;
}

struct InMemoryRepo {
    users: HashMap<u32, String>,
}

impl UserRepo for InMemoryRepo {
    fn find(&self, id: u32) -> Effect<String, RepoError> {
        match self.users.get(&id) {
            Some(name) => Effect::succeed(name.clone()),
            None => Effect::fail(RepoError::NotFound(id)),
        }
    }
}

fn config_layer(tag: &Tag<AppConfig>) -> Layer<RepoError> {
    let build = Effect::try_sync(
        || {
            let db_url = effex::env_get_str("APP_DB_URL", "memory://users");
            if db_url.is_empty() {
                Err("APP_DB_URL is empty".to_string())
            } else {
                Ok(Arc::new(AppConfig { db_url }))
            }
        },
        RepoError::Config,
    );
    Layer::effect(tag, build).named("ConfigLive")
}

fn repo_layer(tag: &Tag<dyn UserRepo>, config: &Tag<AppConfig>) -> Layer<RepoError> {
    let build = Effect::with_service(config, |cfg: Arc<AppConfig>| {
        let db_url = cfg.db_url.clone();
        Effect::<(), RepoError>::log(format!("connecting to {}", db_url)).map(|_| {
            let users = HashMap::from([(1, "ada".to_string()), (2, "grace".to_string())]);
            Arc::new(InMemoryRepo { users }) as Arc<dyn UserRepo>
        })
    });
    Layer::effect(tag, build).named("UserRepoLive")
}

fn lookup(repo: &Tag<dyn UserRepo>, id: u32) -> Effect<String, RepoError> {
    Effect::with_service(repo, move |r: Arc<dyn UserRepo>| r.find(id))
        .catch_tag("NotFound", |_| Effect::succeed("<anonymous>".to_string()))
}

// EFFEX_LOG=debug cargo run -p effex-services
fn main() {
    println!("=== effex Services Example ===\n");

    effex::init_logging();

    let config: Tag<AppConfig> = Tag::new("AppConfig");
    let repo: Tag<dyn UserRepo> = Tag::new("UserRepo");
    let app = repo_layer(&repo, &config).provide(&config_layer(&config));

    let program = Effect::all(vec![lookup(&repo, 1), lookup(&repo, 2), lookup(&repo, 9)]);

    // Without the layer the runtime refuses to start it
    match effex::run(program.clone()) {
        Err(e) => println!("Rejected: {}", e),
        Ok(_) => println!("Unexpected: program without services started"),
    }

    match effex::run_blocking(program.provide(&app)) {
        Ok(Ok(names)) => println!("Users: {:?}", names),
        Ok(Err(cause)) => println!("Program {}", cause),
        Err(e) => println!("Could not start: {}", e),
    }

    println!("\n=== Example Complete ===");
}
