//! autograder CLI - grade a submission directory against a rubric.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use autograder::config::{self, Language, PoolSettings, ServiceConfig};
use autograder::pipeline::{ExecutionStatus, PipelineBuilder, PipelineExecution};
use autograder::sandbox::docker::DockerProvisioner;
use autograder::sandbox::local::LocalProvisioner;
use autograder::sandbox::pool::PoolManager;
use autograder::sandbox::SandboxProvisioner;
use autograder::submission::Submission;
use autograder::template::TemplateRegistry;

#[derive(Parser)]
#[command(name = "autograder")]
#[command(about = "Automated grading for programmer submissions", long_about = None)]
#[command(version)]
struct Cli {
    /// Service configuration file path
    #[arg(short, long, default_value = "autograder.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade one submission directory
    Grade {
        /// Rubric configuration (JSON)
        #[arg(short, long)]
        rubric: PathBuf,

        /// Directory containing the submitted files
        #[arg(short, long)]
        submission: PathBuf,

        /// Template name from the registry
        #[arg(short, long, default_value = "web")]
        template: String,

        /// Submission language tag (python, java, node, c, cpp)
        #[arg(short, long)]
        language: Option<String>,

        /// Preflight setup configuration (JSON)
        #[arg(long)]
        setup: Option<PathBuf>,

        /// Sandbox backend: none, local, or docker
        #[arg(long, default_value = "none")]
        sandbox: String,

        /// Student display name
        #[arg(long, default_value = "student")]
        username: String,

        /// Skip the focus/feedback stages
        #[arg(long)]
        no_feedback: bool,

        /// Print the full execution response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a rubric against a template without grading
    Validate {
        /// Rubric configuration (JSON)
        #[arg(short, long)]
        rubric: PathBuf,

        /// Template name from the registry
        #[arg(short, long, default_value = "web")]
        template: String,
    },

    /// List registered templates and their test functions
    Templates,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Grade {
            rubric,
            submission,
            template,
            language,
            setup,
            sandbox,
            username,
            no_feedback,
            json,
        } => {
            grade(
                &cli.config,
                &rubric,
                &submission,
                &template,
                language.as_deref(),
                setup.as_deref(),
                &sandbox,
                &username,
                !no_feedback,
                json,
            )
            .await
        }
        Commands::Validate { rubric, template } => validate(&rubric, &template),
        Commands::Templates => {
            list_templates();
            Ok(())
        }
    }
}

fn load_service(path: &Path) -> Result<ServiceConfig> {
    if path.exists() {
        config::load_service_config(path)
    } else {
        info!("no service config at {}, using defaults", path.display());
        Ok(ServiceConfig::default())
    }
}

/// Pool settings from the service config, with defaults for every
/// language when none are configured.
fn pool_settings(service: &ServiceConfig) -> BTreeMap<Language, PoolSettings> {
    if !service.pools.is_empty() {
        return service.pools.clone();
    }
    Language::ALL
        .into_iter()
        .map(|language| {
            let settings = PoolSettings::with_image(format!("autograder/{language}:latest"));
            (language, settings)
        })
        .collect()
}

async fn build_pool(
    backend: &str,
    service: &ServiceConfig,
) -> Result<Option<Arc<PoolManager>>> {
    let provisioner: Arc<dyn SandboxProvisioner> = match backend {
        "none" => return Ok(None),
        "local" => Arc::new(LocalProvisioner::in_temp_dir()),
        "docker" => {
            let images = pool_settings(service)
                .iter()
                .map(|(language, settings)| (*language, settings.image.clone()))
                .collect();
            Arc::new(DockerProvisioner::new(service.docker.clone(), images).await?)
        }
        other => anyhow::bail!("unknown sandbox backend: {other} (expected none, local, or docker)"),
    };

    let manager = PoolManager::initialize(provisioner, pool_settings(service)).await?;
    Ok(Some(manager))
}

#[allow(clippy::too_many_arguments)]
async fn grade(
    config_path: &Path,
    rubric_path: &Path,
    submission_dir: &Path,
    template: &str,
    language: Option<&str>,
    setup_path: Option<&Path>,
    sandbox_backend: &str,
    username: &str,
    feedback: bool,
    json: bool,
) -> Result<()> {
    let service = load_service(config_path)?;
    let registry = TemplateRegistry::with_builtins();
    let criteria = config::load_rubric_config(rubric_path)?;

    let pool = build_pool(sandbox_backend, &service).await?;

    let mut builder = PipelineBuilder::new(template, criteria)
        .feedback_config(service.feedback.clone())
        .feedback_enabled(feedback);
    if let Some(path) = setup_path {
        builder = builder.setup(config::load_setup_config(path)?);
    }
    if let Some(pool) = &pool {
        builder = builder.pool(pool.clone());
    }
    let pipeline = builder.build(&registry)?;

    let mut submission = Submission::from_dir("cli", "cli", username, submission_dir).await?;
    if let Some(tag) = language {
        let parsed = tag
            .parse::<Language>()
            .map_err(|e| anyhow::anyhow!(e))
            .context("invalid --language")?;
        submission = submission.with_language(parsed);
    }

    info!(
        files = submission.file_count(),
        template, "grading submission"
    );
    let execution = pipeline.run(&submission).await;

    print_summary(&execution);
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&execution.to_response())?
        );
    }

    if let Some(pool) = pool {
        pool.shutdown().await;
    }

    std::process::exit(match execution.status {
        ExecutionStatus::Success => 0,
        _ => 1,
    });
}

fn print_summary(execution: &PipelineExecution) {
    println!();
    match execution.status {
        ExecutionStatus::Success => {
            let score = execution
                .result
                .as_ref()
                .map(|r| r.final_score)
                .unwrap_or(0.0);
            let styled = if score >= 60.0 {
                console::style(format!("{score:.1}/100")).green().bold()
            } else {
                console::style(format!("{score:.1}/100")).red().bold()
            };
            println!("Final score: {styled}");

            if let Some(feedback) = execution.result.as_ref().and_then(|r| r.feedback.as_ref()) {
                println!();
                println!("{feedback}");
            }
        }
        status => {
            println!(
                "{} ({status:?})",
                console::style("Grading did not complete").red().bold()
            );
            if let Some(step) = execution.failed_at_step() {
                println!("Failed at: {step}");
            }
            for record in &execution.steps {
                if let Some(details) = &record.error_details {
                    println!(
                        "  {}",
                        console::style(
                            serde_json::to_string(details).unwrap_or_default()
                        )
                        .dim()
                    );
                }
            }
        }
    }

    println!();
    println!(
        "Steps: {}/{} in {:?}",
        execution.steps_completed(),
        execution.total_steps_planned,
        execution.execution_time
    );
}

fn validate(rubric_path: &Path, template: &str) -> Result<()> {
    let registry = TemplateRegistry::with_builtins();
    let criteria = config::load_rubric_config(rubric_path)?;

    match PipelineBuilder::new(template, criteria).build(&registry) {
        Ok(pipeline) => {
            println!(
                "{} {} test(s) resolved against template '{template}'",
                console::style("OK").green().bold(),
                pipeline.rubric_tree().test_count()
            );
            Ok(())
        }
        Err(e) => {
            println!("{} {e}", console::style("INVALID").red().bold());
            std::process::exit(1);
        }
    }
}

fn list_templates() {
    let registry = TemplateRegistry::with_builtins();
    for name in registry.names() {
        let Some(template) = registry.get(name) else {
            continue;
        };
        println!(
            "{} (sandbox: {})",
            console::style(name).bold(),
            if template.requires_sandbox() { "required" } else { "not required" }
        );
        for test in template.tests() {
            println!("  {}", test.name());
            for param in test.parameters() {
                println!(
                    "    {} ({}): {}",
                    param.name, param.param_type, param.description
                );
            }
        }
        println!();
    }
}
