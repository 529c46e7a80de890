//! Subcommand implementations.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use gate_core::{GateMode, Router, Store};

use crate::cli::ServeArgs;
use crate::config::{GateConfig, CONFIG_TEMPLATE};
use crate::server::{self, entry_detail, AppState};
use crate::upstream::HttpUpstream;

/// `start` / `replay`: run the proxy server in the given mode.
pub async fn serve(mut config: GateConfig, args: ServeArgs, mode: GateMode) -> anyhow::Result<()> {
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(upstream) = args.upstream {
        config.upstream = upstream;
    }
    if let Some(cache_dir) = args.cache_dir {
        config.cache_dir = cache_dir;
    }

    let store = Arc::new(Store::open(&config.cache_dir).await?);
    let router = match mode {
        GateMode::RecordAndReplay => {
            let upstream = HttpUpstream::new(config.upstream.clone(), config.api_key.clone())?;
            Router::record_and_replay(store, Arc::new(upstream))
        }
        GateMode::ReplayOnly => Router::replay_only(store),
    };

    server::run(AppState {
        config,
        router: Arc::new(router),
    })
    .await
}

/// `cache list`: one line per recorded entry.
pub async fn cache_list(config: &GateConfig) -> anyhow::Result<()> {
    let store = Store::open(&config.cache_dir).await?;
    let mut summaries = store.list().await?;
    summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    if summaries.is_empty() {
        println!("cache is empty ({})", config.cache_dir.display());
        return Ok(());
    }
    for s in &summaries {
        println!(
            "{}  {:>3} {:6} {:<32} {:6} {}",
            &s.id[..12],
            s.status_code,
            s.method,
            s.path,
            if s.is_streaming { "stream" } else { "full" },
            s.model.as_deref().unwrap_or("-"),
        );
    }
    println!("{} entries in {}", summaries.len(), config.cache_dir.display());
    Ok(())
}

/// `cache info <id>`: full entry detail as pretty JSON.
pub async fn cache_info(config: &GateConfig, id: &str) -> anyhow::Result<()> {
    let store = Store::open(&config.cache_dir).await?;
    let entry = store
        .get(id)
        .await?
        .with_context(|| format!("no cache entry with id {id}"))?;
    let chunks = store.read_chunks(&entry.response).await?;
    println!("{}", serde_json::to_string_pretty(&entry_detail(&entry, &chunks))?);
    Ok(())
}

/// `cache clear [--yes]`: wipe the store after confirmation.
pub async fn cache_clear(config: &GateConfig, yes: bool) -> anyhow::Result<()> {
    let store = Store::open(&config.cache_dir).await?;
    let count = store.list().await?.len();

    if count == 0 {
        println!("cache is already empty ({})", config.cache_dir.display());
        return Ok(());
    }
    if !yes {
        print!(
            "Remove {count} entries from {}? [y/N] ",
            config.cache_dir.display()
        );
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("aborted");
            return Ok(());
        }
    }

    store.clear().await?;
    println!("removed {count} entries");
    Ok(())
}

/// `config show`: effective configuration, credentials excluded.
pub fn config_show(config: &GateConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    if config.api_key.is_some() {
        println!("# api_key: set (from environment)");
    }
    Ok(())
}

/// `config init`: write the commented template, refusing to overwrite.
pub fn config_init(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

/// `config path`: print the resolved config file location.
pub fn config_path(path: &Path) {
    println!("{}", path.display());
}

/// `test-gate`: send the test prompt through a running gate.
pub async fn test_gate(config: &GateConfig) -> anyhow::Result<()> {
    let url = format!(
        "http://{}:{}/v1/chat/completions",
        config.host, config.port
    );
    send_test_prompt(config, &url, None).await
}

/// `test-upstream`: send the test prompt straight to the upstream.
pub async fn test_upstream(config: &GateConfig) -> anyhow::Result<()> {
    let url = format!(
        "{}/v1/chat/completions",
        config.upstream.trim_end_matches('/')
    );
    send_test_prompt(config, &url, config.api_key.as_deref()).await
}

async fn send_test_prompt(
    config: &GateConfig,
    url: &str,
    api_key: Option<&str>,
) -> anyhow::Result<()> {
    let body = serde_json::json!({
        "model": config.test_model,
        "messages": [{ "role": "user", "content": config.test_prompt }],
    });

    let client = reqwest::Client::new();
    let mut request = client.post(url).json(&body);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?;
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    println!("{url} -> {status}");
    println!("{text}");
    if !status.is_success() {
        bail!("test request returned {status}");
    }
    Ok(())
}
