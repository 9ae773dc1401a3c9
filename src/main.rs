//! DataLens 命令行入口
//!
//! 对配置中的 SQLite 文件运行一个问题：`datalens [--safe-mode] <question>`。
//! Safe Mode 挂起时在终端询问 y/n，结束后打印 transcript JSON。

use std::sync::Arc;

use anyhow::Context;
use datalens::{
    backend::SqliteEngine,
    llm::{create_llms_from_config, OpenAiEmbedder},
    load_config,
    memory::{EmbeddingPatternIndex, GOLDEN_PATTERNS},
    observability, AgentService,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let safe_flag = args.iter().any(|a| a == "--safe-mode");
    args.retain(|a| a != "--safe-mode");
    let question = args.join(" ");
    if question.trim().is_empty() {
        anyhow::bail!("usage: datalens [--safe-mode] <question>");
    }

    let cfg = load_config(None).context("Failed to load config")?;
    let path = cfg
        .backend
        .database_path
        .clone()
        .context("backend.database_path is not set (DATALENS__BACKEND__DATABASE_PATH)")?;
    let engine = SqliteEngine::open_read_only(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let (worker_llm, router_llm) =
        create_llms_from_config(&cfg).context("OPENAI_API_KEY is not set")?;

    let mut builder = AgentService::builder(worker_llm, Arc::new(engine))
        .with_router_llm(router_llm)
        .with_config(cfg.clone());
    if cfg.retrieval.enabled {
        let key = std::env::var("OPENAI_API_KEY").ok();
        let embedder = OpenAiEmbedder::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.embedding_model,
            key.as_deref(),
        );
        let index = EmbeddingPatternIndex::new(Arc::new(embedder));
        let mut indexed = true;
        for pattern in GOLDEN_PATTERNS {
            if let Err(e) = index.add(pattern).await {
                tracing::warn!(error = %e, "embedding index unavailable, using keyword patterns");
                indexed = false;
                break;
            }
        }
        if indexed {
            builder = builder.with_retriever(Arc::new(index));
        }
    }
    let service = builder.build().await.context("Failed to build agent")?;

    let config = service
        .default_run_config()
        .with_safe_mode(cfg.run.safe_mode || safe_flag);
    let mut handle = service.start_run(&question, config).await;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let transcript = loop {
        let t = handle.wait().await;
        if !t.is_awaiting_approval() {
            break t;
        }
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(b"Safe mode: approve delegation to the next worker? [y/N] ")
            .await?;
        stdout.flush().await?;
        let mut line = String::new();
        stdin.read_line(&mut line).await?;
        let approved = matches!(line.trim().to_lowercase().as_str(), "y" | "yes");
        service
            .submit_approval(&handle.run_id, approved)
            .await
            .context("Failed to submit approval")?;
    };

    println!("{}", serde_json::to_string_pretty(&transcript)?);
    Ok(())
}
