use anyhow::Context;
use ares_pipeline::agents::{
    LlmClarifier, LlmDirectResponder, LlmPlanner, LlmRouter, LlmSourceExecutor, LlmSummarizer,
};
use ares_pipeline::cli::{output::Output, Cli, Commands};
use ares_pipeline::llm::LLMClient;
use ares_pipeline::{Pipeline, PipelineConfig, PipelineConfigManager, RunContext, RunOutcome};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse_args();
    let output = if cli.no_color {
        Output::no_color()
    } else {
        Output::new()
    };

    let manager = load_config(&cli, &output)?;
    let config = manager.config();
    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Run {
            message,
            json,
            run_timeout,
        } => run(&config, message.join(" "), json, run_timeout, &output).await,
        Commands::Config { full, validate } => {
            if validate {
                output.success(&format!("{} is valid", cli.config.display()));
            }
            show_config(&config, full, &output)
        }
        Commands::Sources => {
            if config.sources.is_empty() {
                output.warning("No sources configured; add [sources.<id>] sections");
                return Ok(());
            }
            output.header("Data sources");
            output.table_header(&["Source", "Description"]);
            for (id, source) in &config.sources {
                output.table_row(&[id.as_str(), source.description.as_str()]);
            }
            Ok(())
        }
    }
}

fn load_config(cli: &Cli, output: &Output) -> anyhow::Result<PipelineConfigManager> {
    let validating = matches!(cli.command, Commands::Config { validate: true, .. });
    if cli.config.exists() || validating {
        return PipelineConfigManager::new(&cli.config)
            .with_context(|| format!("failed to load {}", cli.config.display()));
    }

    output.warning(&format!(
        "{} not found, using default configuration",
        cli.config.display()
    ));
    Ok(PipelineConfigManager::from_config(PipelineConfig::default()))
}

/// Logs go to stderr so stdout carries only run output.
fn init_tracing(config: &PipelineConfig, verbose: bool) {
    let default_level = if verbose {
        "debug"
    } else {
        config.server.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("ares_pipeline={}", default_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.server.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(
    config: &PipelineConfig,
    message: String,
    json: bool,
    run_timeout: Option<u64>,
    output: &Output,
) -> anyhow::Result<()> {
    let llm: Arc<dyn LLMClient> = Arc::from(config.provider().create_client().await?);
    let sources = config.source_descriptors();
    if sources.is_empty() {
        output.warning("No sources configured; research questions will plan no queries");
    }

    let pipeline = Pipeline::builder()
        .router(Arc::new(LlmRouter::new(llm.clone())))
        .clarifier(Arc::new(LlmClarifier::new(llm.clone())))
        .planner(Arc::new(LlmPlanner::new(llm.clone(), sources.clone())))
        .direct_responder(Arc::new(LlmDirectResponder::new(llm.clone())))
        .summarizer(Arc::new(LlmSummarizer::new(llm.clone())))
        .executor(Arc::new(LlmSourceExecutor::new(llm, sources)))
        .sink(config.build_sink())
        .build()?;

    let mut run_config = config.to_run_config();
    if let Some(secs) = run_timeout {
        run_config = run_config.with_run_timeout(Duration::from_secs(secs));
    }
    let ctx = RunContext::new(config.credential()?, run_config);
    let conversation = vec![ares_pipeline::Message::user(message)].into();

    let mut events = pipeline.run(conversation, ctx);
    let mut in_text = false;
    while let Some(event) = events.next().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            output.event(&event, &mut in_text);
        }
    }

    let record = events.finish().await?;
    if !json {
        output.kv("run", &record.run_id.to_string());
        output.kv(
            "tokens",
            &record.total_token_usage.total_tokens.to_string(),
        );
        output.kv("duration", &format!("{}ms", record.duration_ms));
    }

    match record.outcome {
        Some(RunOutcome::Failed) | Some(RunOutcome::Aborted) => {
            anyhow::bail!("run {} did not complete", record.run_id)
        }
        _ => Ok(()),
    }
}

fn show_config(config: &PipelineConfig, full: bool, output: &Output) -> anyhow::Result<()> {
    if full {
        println!("{}", toml::to_string_pretty(config)?);
        return Ok(());
    }

    let run = config.to_run_config();
    output.header("Pipeline");
    output.kv("task timeout", &format!("{:?}", run.task_timeout));
    output.kv(
        "run timeout",
        &run.run_timeout
            .map(|t| format!("{:?}", t))
            .unwrap_or_else(|| "none".to_string()),
    );
    output.kv("max retries", &run.max_retries.to_string());
    output.kv("max concurrency", &run.max_concurrency.to_string());
    output.kv("monitoring", &run.monitoring_enabled.to_string());

    output.header("LLM");
    output.kv("provider", config.provider().name());
    output.kv("model", &config.llm.model);
    output.kv("base url", &config.llm.base_url);

    output.header("Monitor");
    output.kv("sink", &format!("{:?}", config.monitor.sink));
    if let Some(path) = &config.monitor.path {
        output.kv("path", &path.display().to_string());
    }

    output.hint("Use `ares-pipeline sources` to list data sources");
    Ok(())
}
