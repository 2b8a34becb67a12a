//! Capstan - CI orchestration engine CLI
//!
//! The `capstan` command resolves a deterministic version for the current
//! source state and runs the configured build phases. The exact same graph
//! and version computation happens whether a human runs this locally or a
//! remote orchestrator drives it - there is no privileged execution mode.
//!
//! ## Commands
//!
//! - `checkout-source-tree`: check out a clean tree at the target ref
//! - `prepare-source-tree`: merge change requests, apply modality changes,
//!   bump the version
//! - `build`: construct the execution graph and run it (optionally one
//!   phase/variant)
//! - `submit`: tag the resolved version and run post-submit steps
//! - `may-publish`: report whether this state would publish
//! - `unbundle`: import a git bundle

mod exec;
mod git;

use anyhow::{Context, Result};
use capstan_ci::{resolve_plain_steps, GraphBuilder, Scheduler, StepRunner};
use capstan_core::version::{derive_id_from_branch, id_from_commit, VersionResolver};
use capstan_core::{
    obs, BuildConfig, BuildContext, BumpLevel, ConfigError, Executor, SourceProvider, VersionError,
};
use clap::{Parser, Subcommand};
use exec::{EnvSecretStore, ProcessExecutor};
use git::GitSource;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const EXIT_STEP_FAILURE: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 32;
const EXIT_VERSION_ERROR: u8 = 33;
const EXIT_NOTHING_TO_DO: u8 = 34;

#[derive(Parser)]
#[command(name = "capstan")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CI orchestration engine", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "capstan.yml")]
    config: PathBuf,

    /// Workspace directory (the repository checkout)
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted output and log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check out a clean source tree at the given ref
    CheckoutSourceTree {
        /// Ref to check out
        #[arg(long)]
        target_ref: String,
    },

    /// Prepare the source tree for building
    PrepareSourceTree {
        #[command(subcommand)]
        action: PrepareAction,
    },

    /// Resolve the version, build the execution graph, and run it
    Build {
        /// Run only this phase
        #[arg(long)]
        phase: Option<String>,

        /// Run only this variant
        #[arg(long)]
        variant: Option<String>,
    },

    /// Tag the resolved version and run post-submit steps
    Submit,

    /// Report whether the current state would publish a new version
    MayPublish,

    /// Import a git bundle into the workspace repository
    Unbundle {
        /// Bundle file
        bundle: PathBuf,
    },
}

#[derive(Subcommand)]
enum PrepareAction {
    /// Merge a change request ref into the current tree
    MergeChangeRequest {
        /// Ref to merge
        #[arg(long)]
        source_ref: String,

        /// Merge commit message
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Run the configured source preparation steps for a modality
    ApplyModalityChange {
        /// Modality name (as declared in modality-source-preparation)
        modality: String,
    },

    /// Resolve and print the version for the current source state
    BumpVersion,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env("CAPSTAN_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Map error categories onto the documented exit codes.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        EXIT_CONFIG_ERROR
    } else if err.downcast_ref::<VersionError>().is_some() {
        EXIT_VERSION_ERROR
    } else {
        EXIT_STEP_FAILURE
    }
}

/// Resolved global options, separated from the parsed command.
struct App {
    config: PathBuf,
    workspace: PathBuf,
    json: bool,
}

async fn run(cli: Cli) -> Result<u8> {
    let app = App {
        config: cli.config,
        workspace: cli.workspace,
        json: cli.json,
    };
    let git = GitSource::new(&app.workspace);

    match cli.command {
        Commands::CheckoutSourceTree { target_ref } => {
            let commit = git.checkout(&target_ref).await?;
            info!(commit = %commit.short(), r#ref = %target_ref, "checked out source tree");
            println!("{commit}");
            Ok(0)
        }

        Commands::Unbundle { bundle } => {
            git.unbundle(&bundle).await?;
            info!(bundle = %bundle.display(), "unbundled into workspace");
            Ok(0)
        }

        Commands::PrepareSourceTree { action } => {
            let config = load_config(&app)?;
            prepare_source_tree(&app, &config, &git, action).await
        }

        Commands::Build { phase, variant } => {
            let config = load_config(&app)?;
            build(&app, &config, &git, phase, variant).await
        }

        Commands::Submit => {
            let config = load_config(&app)?;
            submit(&app, &config, &git).await
        }

        Commands::MayPublish => {
            let config = load_config(&app)?;
            let ctx = resolve_context(&config, &git).await?;
            if ctx.may_publish {
                println!("yes: {}", ctx.resolved.publish_version(&ctx.tag_pattern));
                Ok(0)
            } else {
                println!("no");
                Ok(EXIT_STEP_FAILURE)
            }
        }
    }
}

fn load_config(app: &App) -> Result<BuildConfig> {
    let path = if app.config.is_absolute() {
        app.config.clone()
    } else {
        app.workspace.join(&app.config)
    };
    let config = BuildConfig::load(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    Ok(config)
}

/// Assemble the immutable build context: git state, commit range, resolved
/// version, pass-through environment.
async fn resolve_context(config: &BuildConfig, git: &GitSource) -> Result<BuildContext> {
    let head = git.head_commit().await?;
    let branch = git.current_branch().await?;
    let branch_name = branch.clone().unwrap_or_default();

    let tag_pattern = config.version.tag_pattern()?;
    let format = config.version.format;

    let last_tag = git.last_version_tag().await?;
    let (base_version, base_commit) = match &last_tag {
        Some(tag) => match tag_pattern.parse(tag, format) {
            Ok(version) => {
                let commit = git.rev_parse(&format!("{tag}^{{commit}}")).await?;
                (Some(version), Some(commit))
            }
            Err(_) => {
                warn!(tag = %tag, "last tag does not match the tag pattern, ignoring");
                (None, None)
            }
        },
        None => (None, None),
    };

    let range = git.commit_range(base_commit.as_ref(), &head).await?;
    let resolver = VersionResolver::new(
        config.version.bump.clone(),
        config.version.branch_policy(&branch_name)?,
        &branch_name,
    );

    let resolved = if config.version.is_hotfix_branch(&branch_name)? {
        let base = base_version.clone().ok_or(VersionError::NoVersionFound)?;
        let split_point = base_commit.clone().unwrap_or_else(|| head.clone());
        let first_unique = git.first_unique_commit(&split_point, &head).await?;

        let id_pattern = config.version.hotfix_pattern()?;
        let id = match derive_id_from_branch(&branch_name, &id_pattern, &base)? {
            Some(id) => id,
            None => id_from_commit(&first_unique),
        };
        let prior = count_prior_hotfixes(git, config, &base, &id).await?;
        resolver.resolve_hotfix(base, &range, Some(&id_pattern), &first_unique, prior)?
    } else {
        resolver.resolve(base_version.clone(), config.version.initial_version()?, &range)?
    };

    let mut environment = BTreeMap::new();
    for name in &config.pass_through_environment_vars {
        match std::env::var(name) {
            Ok(value) => {
                environment.insert(name.clone(), value);
            }
            Err(_) => warn!(var = %name, "pass-through variable not set"),
        }
    }

    let last_published = base_version;
    let may_publish = config.version.tag_enabled()
        && match &last_published {
            Some(published) => resolved.version != *published,
            None => true,
        };

    Ok(BuildContext {
        build_id: Uuid::new_v4(),
        branch,
        range,
        resolved,
        tag_pattern,
        last_published,
        may_publish,
        environment,
    })
}

/// Count existing hotfix versions with this identifier on this base, to
/// pick the next counter value.
async fn count_prior_hotfixes(
    git: &GitSource,
    config: &BuildConfig,
    base: &capstan_core::Version,
    id: &str,
) -> Result<u64> {
    let tag_pattern = config.version.tag_pattern()?;
    let next = base.bump(BumpLevel::Patch);
    let prefix = format!("hotfix.{id}.");

    let tags = git.list_tags(&format!("*hotfix.{id}.*")).await?;
    let count = tags
        .iter()
        .filter_map(|tag| tag_pattern.parse(tag, config.version.format).ok())
        .filter(|v| {
            v.major() == next.major()
                && v.minor() == next.minor()
                && v.patch() == next.patch()
                && v.prerelease().is_some_and(|p| p.starts_with(&prefix))
        })
        .count();
    Ok(count as u64)
}

async fn prepare_source_tree(
    app: &App,
    config: &BuildConfig,
    git: &GitSource,
    action: PrepareAction,
) -> Result<u8> {
    match action {
        PrepareAction::MergeChangeRequest {
            source_ref,
            message,
        } => {
            let message = message.unwrap_or_else(|| format!("Merge {source_ref}"));
            let commit = git.merge_no_ff(&source_ref, &message).await?;
            info!(commit = %commit.short(), "merged change request");
            println!("{commit}");
            Ok(0)
        }

        PrepareAction::ApplyModalityChange { modality } => {
            let steps = config
                .modality(&modality)
                .ok_or_else(|| {
                    ConfigError::Malformed(format!("no source preparation for modality '{modality}'"))
                })?
                .steps
                .clone();
            let ctx = resolve_context(config, git).await?;
            let resolved = resolve_plain_steps(&steps, &ctx.variables())?;

            let executor: Arc<dyn Executor> = Arc::new(ProcessExecutor::new(&app.workspace));
            let runner = StepRunner::new(executor.clone(), Arc::new(EnvSecretStore::new()));
            let node = executor.allocate("source-preparation", None).await?;
            for step in &resolved {
                let outcome = runner.run_step(&node, step).await?;
                if !outcome.passed() {
                    error!(step = %step.name, exit_code = outcome.exit_code, "modality step failed");
                    return Ok(EXIT_STEP_FAILURE);
                }
            }
            Ok(0)
        }

        PrepareAction::BumpVersion => {
            let ctx = resolve_context(config, git).await?;
            if ctx.resolved.bump == BumpLevel::None && !ctx.version_is_new() {
                info!(version = %ctx.resolved.version, "no bumpable change found");
                return Ok(EXIT_NOTHING_TO_DO);
            }
            if app.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "version": ctx.resolved.version.to_string(),
                        "pure_version": ctx.resolved.pure_version().to_string(),
                        "publish_version": ctx.resolved.publish_version(&ctx.tag_pattern),
                        "bump": ctx.resolved.bump.to_string(),
                    })
                );
            } else {
                println!("{}", ctx.resolved.version);
            }
            Ok(0)
        }
    }
}

async fn build(
    app: &App,
    config: &BuildConfig,
    git: &GitSource,
    phase: Option<String>,
    variant: Option<String>,
) -> Result<u8> {
    let ctx = resolve_context(config, git).await?;
    let _span = obs::BuildSpan::enter(&ctx.build_id.to_string());

    let changed = match (&ctx.range.base, &ctx.range.target) {
        (Some(base), target) if base != target => git.changed_paths(base, target).await?,
        _ => Vec::new(),
    };

    let graph = Arc::new(
        GraphBuilder::new(config, &ctx)
            .changed_paths(changed)
            .phase(phase)
            .variant(variant)
            .build()?,
    );
    obs::emit_graph_built(
        &ctx.build_id.to_string(),
        &graph.config_digest,
        graph.phases.len(),
    );

    if graph.is_empty() {
        info!("nothing to do: every step is gated out");
        return Ok(EXIT_NOTHING_TO_DO);
    }

    // Forward SIGINT as a graceful shutdown: the running step finishes (or
    // terminates on its own), then the scheduler stops.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current step");
            let _ = shutdown_tx.send(true);
        }
    });

    let scheduler = Scheduler::new(
        Arc::new(ProcessExecutor::new(&app.workspace)),
        Arc::new(EnvSecretStore::new()),
    )
    .with_shutdown(shutdown_rx);

    let result = scheduler.run(graph, &ctx).await?;

    if app.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for phase in &result.phases {
            let status = if phase.skipped {
                "skipped"
            } else if phase.success {
                "ok"
            } else {
                "failed"
            };
            println!("phase {:<20} {}", phase.phase, status);
        }
        println!(
            "{} steps passed, {} failed ({} ms)",
            result.passed_count(),
            result.failed_count(),
            result.duration_ms
        );
    }

    Ok(if result.success { 0 } else { EXIT_STEP_FAILURE })
}

async fn submit(app: &App, config: &BuildConfig, git: &GitSource) -> Result<u8> {
    let ctx = resolve_context(config, git).await?;
    if !ctx.may_publish {
        info!("nothing to publish: version unchanged since last tag");
        return Ok(EXIT_NOTHING_TO_DO);
    }

    let tag = ctx.resolved.publish_version(&ctx.tag_pattern);
    git.create_tag(&tag, &format!("Release {}", ctx.resolved.pure_version()))
        .await?;
    info!(tag = %tag, "created release tag");

    let executor: Arc<dyn Executor> = Arc::new(ProcessExecutor::new(&app.workspace));
    let runner = StepRunner::new(executor.clone(), Arc::new(EnvSecretStore::new()));
    for named in &config.post_submit {
        let steps = resolve_plain_steps(&named.steps, &ctx.variables())?;
        let node = executor.allocate(&named.name, None).await?;
        for step in &steps {
            let outcome = runner.run_step(&node, step).await?;
            if !outcome.passed() {
                error!(step = %step.name, exit_code = outcome.exit_code, "post-submit step failed");
                return Ok(EXIT_STEP_FAILURE);
            }
        }
    }

    println!("{tag}");
    Ok(0)
}
