//! Tether Runtime
//!
//! Minimal binary that boots a scripted host: registers a demo class and
//! a few host functions, runs a script (path from argv, or the builtin
//! demo chunk), and prints the captured output.

use std::path::PathBuf;

use anyhow::Result;
use tracing_subscriber;

use tether_script::{ClassBuilder, RuntimeSettings, ScriptRuntime, Validation};

struct Sprite {
    name: String,
    health: i64,
    tags: Vec<String>,
}

const DEMO: &str = r#"
    local s = Sprite.new("slime", 20)
    s.health = s.health + 22
    s.tags[#s.tags + 1] = "hostile"
    print("sprite", s.name, s.health)
    for i, tag in s.tags:iter() do
        print(i, tag)
    end
    print("distance", game.distance(3, 4))

    local ok, err = pcall(function() s.health = -5 end)
    print("negative health accepted:", ok)
"#;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    tracing::info!("Tether v{}", tether_core::VERSION);

    let settings = load_settings().unwrap_or_default();
    let runtime = ScriptRuntime::with_settings(settings)?;

    runtime.register_class(
        ClassBuilder::<Sprite>::new("Sprite")
            .constructor2(|name: String, health: i64| Sprite {
                name,
                health,
                tags: Vec::new(),
            })
            .readonly("name", |s: &Sprite| s.name.clone())
            .property("health", |s: &Sprite| s.health, |s: &mut Sprite, h| s.health = h)
            .collection(
                "tags",
                |s: &Sprite| s.tags.clone(),
                |s: &mut Sprite, tags| s.tags = tags,
            )
            .on_will_change(|_s, prop, _old, new| {
                if prop == "health" && new.as_integer().is_some_and(|h| h < 0) {
                    Validation::reject("health must be non-negative")
                } else {
                    Validation::Accept
                }
            }),
    )?;

    let game = runtime.register_namespace("game")?;
    game.register_function2("distance", |dx: f64, dy: f64| (dx * dx + dy * dy).sqrt())?;

    let output = match std::env::args().nth(1) {
        Some(path) => runtime.execute_file(&PathBuf::from(path))?,
        None => runtime.execute(DEMO)?,
    };
    print!("{output}");

    Ok(())
}

/// Optional settings file next to the binary's working directory.
fn load_settings() -> Option<RuntimeSettings> {
    let text = std::fs::read_to_string("tether.json").ok()?;
    match serde_json::from_str(&text) {
        Ok(settings) => Some(settings),
        Err(err) => {
            tracing::warn!("ignoring malformed tether.json: {err}");
            None
        }
    }
}
