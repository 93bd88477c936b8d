use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::client::VisionClient;
use crate::config::{AppConfig, RetryMode};

/// Resolve an image argument to an absolute path the server can open.
fn resolve_image(image: &Path) -> Result<PathBuf> {
    if !image.is_file() {
        bail!("No such image: {}", image.display());
    }
    image
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", image.display()))
}

pub async fn analyze(
    config: &AppConfig,
    image: &Path,
    prompt: Option<&str>,
    soft: bool,
) -> Result<()> {
    let image = resolve_image(image)?;
    let prompt = prompt.unwrap_or(&config.analysis.default_prompt);
    let client = VisionClient::new(config);

    let outcome = if soft || config.retry.mode == RetryMode::Soft {
        client.analyze_or_skip(&image, prompt).await
    } else {
        client.analyze(&image, prompt).await.ok()
    };
    client.stop().await;

    match outcome {
        Some(text) => {
            println!("{text}");
            Ok(())
        }
        None => bail!("Analysis unavailable for {}", image.display()),
    }
}

pub async fn tools(config: &AppConfig) -> Result<()> {
    let client = VisionClient::new(config);
    let listed = client.capabilities().await;
    client.stop().await;

    let tools = listed.context("Failed to list server tools")?;
    if tools.is_empty() {
        println!("(server offers no tools)");
    }
    for tool in tools {
        if tool.description.is_empty() {
            println!("{}", tool.name);
        } else {
            println!("{}: {}", tool.name, tool.description);
        }
    }
    Ok(())
}

/// One analysis per stdin line until EOF or `exit`.
pub async fn watch(config: &AppConfig, prompt: Option<&str>) -> Result<()> {
    let prompt = prompt.unwrap_or(&config.analysis.default_prompt);
    let soft = config.retry.mode == RetryMode::Soft;
    let client = VisionClient::new(config);
    if let Err(e) = client.start().await {
        eprintln!("Vision server not up yet ({e}); will keep trying");
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    eprintln!("glimpse watch: one image path per line ('exit' to quit)");

    loop {
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        let image = match resolve_image(Path::new(line)) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        let outcome = if soft {
            client.analyze_or_skip(&image, prompt).await
        } else {
            client.analyze(&image, prompt).await.ok()
        };
        match outcome {
            Some(text) => println!("{}\n{text}\n", image.display()),
            None => eprintln!("{}: analysis skipped", image.display()),
        }
    }

    let status = client.status().await;
    info!(
        "Watch finished: {} server launches, {} restarts, {} stale lines drained",
        status.launches, status.failures.restarts, status.stale_drained
    );
    client.stop().await;
    Ok(())
}
