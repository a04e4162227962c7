use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use triage_config::LogFormat;

use crate::recluster::DEFAULT_RECLUSTER_BATCH_SIZE;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Test failure ingestion and clustering")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace holding .triage/config.toml and the database"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        value_parser = parse_log_format,
        help = "Log format: human or json (overrides [logging].format)"
    )]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Record that a build completed
    JoinBuild(JoinBuildArgs),
    /// Record that a presubmit run completed for some of its builds
    JoinPresubmit(JoinPresubmitArgs),
    /// Print presubmit join statistics by project
    JoinStats(JoinStatsArgs),
    /// Manage failure association rules
    Rules(RulesArgs),
    /// Cluster and store the failures of a ready build
    Ingest(IngestArgs),
    /// Re-cluster stale chunks of a project
    Recluster(ReclusterArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct JoinBuildArgs {
    #[arg(long)]
    pub project: String,

    #[arg(long, default_value = "cr-buildbucket.appspot.com", help = "Buildbucket host")]
    pub host: String,

    #[arg(long, help = "Build ID")]
    pub id: i64,

    #[arg(long, help = "The build is part of a presubmit run")]
    pub presubmit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct JoinPresubmitArgs {
    #[arg(long)]
    pub project: String,

    #[arg(long, help = "Presubmit run ID, e.g. project/123-1-abcdef")]
    pub run_id: String,

    #[arg(long, default_value = "SUCCEEDED")]
    pub status: String,

    #[arg(long, default_value = "")]
    pub owner: String,

    #[arg(long, help = "The run's result is critical to submission")]
    pub critical: bool,

    #[arg(
        long = "build",
        required = true,
        help = "Build of the run as {host}/{id}; repeat for each build"
    )]
    pub builds: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct JoinStatsArgs {
    #[arg(long, help = "Hours of history (overrides [join_stats].hours)")]
    pub hours: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RulesArgs {
    #[command(subcommand)]
    pub command: RulesCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum RulesCommand {
    /// Create or replace a rule
    Put(RulesPutArgs),
    /// List the rules of a project
    List(RulesListArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RulesPutArgs {
    #[arg(long)]
    pub project: String,

    #[arg(long, help = "Rule to replace; a new ID is generated if omitted")]
    pub rule_id: Option<String>,

    #[arg(long, help = "Rule definition, e.g. reason LIKE \"%timed out%\"")]
    pub definition: String,

    #[arg(long, help = "Store the rule deactivated")]
    pub inactive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RulesListArgs {
    #[arg(long)]
    pub project: String,

    #[arg(long, help = "Include inactive rules")]
    pub all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct IngestArgs {
    #[arg(long)]
    pub project: String,

    #[arg(long, help = "Control record key of the build, {host}/{id}")]
    pub build_id: String,

    #[arg(long, help = "JSON file holding an array of failures")]
    pub failures: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ReclusterArgs {
    #[arg(long)]
    pub project: String,

    #[arg(long, default_value_t = DEFAULT_RECLUSTER_BATCH_SIZE, help = "Chunks read per page")]
    pub batch_size: usize,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}
