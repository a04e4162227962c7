use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use triage_clustering::AlgorithmRegistry;
use triage_config::{TriageConfig, database_path, ensure_workspace_config, validate_config};
use triage_core::{
    BuildResult, Failure, LUCI_CV_SYSTEM, PresubmitResult, PresubmitRunId, RuleRecord, SystemClock,
};
use triage_ingestion::{
    JoinOutcome, control_build_id, join_build_result, join_presubmit_results,
    read_presubmit_join_statistics,
};
use triage_rules::{RulesCache, generate_rule_id, save_rule};
use triage_store::{RuleStore, SqliteStore};
use triaged::cli::{
    Cli, Commands, IngestArgs, JoinBuildArgs, JoinPresubmitArgs, JoinStatsArgs, ReclusterArgs,
    RulesCommand, RulesListArgs, RulesPutArgs,
};
use triaged::ingest::ingest_ready_build;
use triaged::logging::init_logging;
use triaged::recluster::recluster_project;

fn main() -> Result<()> {
    let cli = parse_cli();
    run(cli)
}

fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn run(cli: Cli) -> Result<()> {
    fs::create_dir_all(&cli.workspace).with_context(|| {
        format!("failed to create workspace {}", cli.workspace.display())
    })?;
    let workspace = cli.workspace.canonicalize().with_context(|| {
        format!(
            "failed to resolve workspace path {}",
            cli.workspace.display()
        )
    })?;

    let config = ensure_workspace_config(&workspace).with_context(|| {
        format!(
            "failed to load or create workspace config at {}",
            workspace.join(".triage/config.toml").display()
        )
    })?;
    init_logging(
        &config.logging.level,
        cli.log_format.unwrap_or(config.logging.format),
    )?;
    for warning in validate_config(&config) {
        tracing::warn!(code = warning.code, "{}", warning.message);
    }

    let store = open_store(&workspace, &config)?;
    match cli.command {
        Commands::JoinBuild(args) => run_join_build(&store, args),
        Commands::JoinPresubmit(args) => run_join_presubmit(&store, args),
        Commands::JoinStats(args) => run_join_stats(&store, &config, args),
        Commands::Rules(args) => match args.command {
            RulesCommand::Put(args) => run_rules_put(&store, args),
            RulesCommand::List(args) => run_rules_list(&store, args),
        },
        Commands::Ingest(args) => run_ingest(store, &config, args),
        Commands::Recluster(args) => run_recluster(store, &config, args),
    }
}

fn open_store(workspace: &Path, config: &TriageConfig) -> Result<Arc<SqliteStore>> {
    let path = database_path(workspace, config);
    let store = SqliteStore::open(&path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    Ok(Arc::new(store))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}

#[derive(Serialize)]
struct JoinReport<'a> {
    build_id: &'a str,
    outcome: &'static str,
}

fn join_report<'a>(build_id: &'a str, outcome: &JoinOutcome) -> JoinReport<'a> {
    let outcome = match outcome {
        JoinOutcome::Pending => "pending",
        JoinOutcome::Ready(_) => "ready",
        JoinOutcome::Duplicate => "duplicate",
    };
    JoinReport { build_id, outcome }
}

fn run_join_build(store: &SqliteStore, args: JoinBuildArgs) -> Result<()> {
    let build_id = control_build_id(&args.host, args.id);
    let build_result = BuildResult {
        host: args.host,
        id: args.id,
        creation_time: Some(Utc::now()),
        project: args.project.clone(),
    };
    let outcome = join_build_result(store, &args.project, &build_id, args.presubmit, build_result)
        .with_context(|| format!("failed to join build {build_id}"))?;
    print_json(&join_report(&build_id, &outcome))
}

fn run_join_presubmit(store: &SqliteStore, args: JoinPresubmitArgs) -> Result<()> {
    let result = PresubmitResult {
        presubmit_run_id: Some(PresubmitRunId {
            system: LUCI_CV_SYSTEM.to_owned(),
            id: args.run_id.clone(),
        }),
        status: args.status,
        owner: args.owner,
        critical: args.critical,
        creation_time: Some(Utc::now()),
    };
    let results: Vec<(String, PresubmitResult)> = args
        .builds
        .iter()
        .map(|build_id| (build_id.clone(), result.clone()))
        .collect();

    let outcomes = join_presubmit_results(store, &args.project, results)
        .with_context(|| format!("failed to join presubmit run {}", args.run_id))?;
    let reports: Vec<JoinReport<'_>> = args
        .builds
        .iter()
        .zip(&outcomes)
        .map(|(build_id, outcome)| join_report(build_id, outcome))
        .collect();
    print_json(&reports)
}

fn run_join_stats(store: &SqliteStore, config: &TriageConfig, args: JoinStatsArgs) -> Result<()> {
    let hours = match args.hours {
        Some(hours) => hours,
        None => usize::try_from(config.join_stats.hours)
            .context("[join_stats].hours is out of range")?,
    };
    let stats = read_presubmit_join_statistics(store, store.now(), hours)
        .context("failed to read join statistics")?;
    print_json(&stats)
}

fn run_rules_put(store: &SqliteStore, args: RulesPutArgs) -> Result<()> {
    let rule = RuleRecord {
        project: args.project,
        rule_id: args.rule_id.unwrap_or_else(generate_rule_id),
        definition: args.definition,
        is_active: !args.inactive,
        creation_time: None,
        last_updated: None,
        source_cluster: None,
    };
    let saved = save_rule(store, &rule)
        .with_context(|| format!("failed to save rule {}", rule.rule_id))?;
    print_json(&saved)
}

fn run_rules_list(store: &SqliteStore, args: RulesListArgs) -> Result<()> {
    let rules = if args.all {
        store.read_all(&args.project)
    } else {
        store.read_active(&args.project)
    }
    .with_context(|| format!("failed to read rules of project {}", args.project))?;
    print_json(&rules)
}

fn clustering_context(
    store: Arc<SqliteStore>,
    config: &TriageConfig,
) -> Result<(AlgorithmRegistry, RulesCache)> {
    let registry = AlgorithmRegistry::new(&config.clustering.test_name_rules)
        .context("invalid [clustering].test_name_rules")?;
    let refresh_interval = chrono::Duration::from_std(std::time::Duration::from_secs(
        config.rules.refresh_interval_secs,
    ))
    .context("[rules].refresh_interval_secs is out of range")?;
    let rules = RulesCache::new(store, Arc::new(SystemClock), refresh_interval);
    Ok((registry, rules))
}

fn run_ingest(store: Arc<SqliteStore>, config: &TriageConfig, args: IngestArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.failures)
        .with_context(|| format!("failed to read {}", args.failures.display()))?;
    let failures: Vec<Failure> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse failures in {}", args.failures.display()))?;
    if config.clustering.chunk_size == 0 {
        bail!("[clustering].chunk_size must be positive");
    }

    let (registry, rules) = clustering_context(Arc::clone(&store), config)?;
    let summary = ingest_ready_build(
        store.as_ref(),
        &registry,
        &rules,
        &args.project,
        &args.build_id,
        failures,
        config.clustering.chunk_size,
    )?;
    print_json(&summary)
}

fn run_recluster(store: Arc<SqliteStore>, config: &TriageConfig, args: ReclusterArgs) -> Result<()> {
    let (registry, rules) = clustering_context(Arc::clone(&store), config)?;
    let summary = recluster_project(
        store.as_ref(),
        &registry,
        &rules,
        &args.project,
        args.batch_size,
    )?;
    print_json(&summary)
}
