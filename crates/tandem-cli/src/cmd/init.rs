use anyhow::Context;
use std::path::Path;
use tandem_core::config::Config;
use tandem_core::{io, paths};

pub fn run(root: &Path, engine: Option<&str>) -> anyhow::Result<()> {
    println!("Initializing tandem in: {}", root.display());

    let state = paths::state_dir(root);
    io::ensure_dir(&state).with_context(|| format!("failed to create {}", state.display()))?;

    let config_path = paths::config_path(root);
    let mut config = Config::load(root).context("failed to read config.yaml")?;
    let existed = config_path.exists();
    if let Some(program) = engine {
        config.engine.program = program.to_string();
    }
    if !existed || engine.is_some() {
        config.save(root).context("failed to write config.yaml")?;
        println!("  {}: {}", if existed { "updated" } else { "created" }, paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    // Lock, audit and queue files are per-machine state, never versioned.
    let ignore = config.engine.ignore_file();
    io::ensure_ignore_entry(root, ignore, &format!("{}/", paths::STATE_DIR))
        .with_context(|| format!("failed to update {ignore}"))?;
    println!("  ignored: {}/ in {ignore}", paths::STATE_DIR);

    for warning in config.validate() {
        println!("  [{:?}] {}", warning.level, warning.message);
    }

    println!("\ntandem initialized.");
    println!("Next: tandem lock acquire, then tandem watch");
    Ok(())
}
