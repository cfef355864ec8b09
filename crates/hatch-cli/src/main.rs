mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONSENT_DENIED, EXIT_FAILURE, EXIT_PLAN_ERROR};
use hatch_core::{hatch_home, install_signal_handler};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "hatch",
    version,
    about = "Install the dependencies a Hatch package declares"
)]
struct Cli {
    /// Hatch home directory (config, environments, local packages).
    /// Defaults to $HATCH_HOME, then ~/.hatch.
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve a package's dependencies and print the installation plan.
    Plan {
        /// Package directory or path to hatch_metadata.json.
        #[arg(default_value = ".")]
        package: PathBuf,
    },
    /// Install every dependency of a package, rolling back on failure.
    Install {
        /// Package directory or path to hatch_metadata.json.
        #[arg(default_value = ".")]
        package: PathBuf,
        /// Environment the installed dependencies are recorded in.
        #[arg(long, default_value = "default")]
        env: String,
        /// Approve the plan without prompting.
        #[arg(short, long, default_value_t = false, conflicts_with = "no")]
        yes: bool,
        /// Refuse the plan; nothing is installed.
        #[arg(long, default_value_t = false)]
        no: bool,
        /// Drive every installer in simulation mode; nothing is changed.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Maximum dependency chains installed at once within a stage.
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Per-dependency timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Abort unless the plan's fingerprint matches (from `hatch plan`).
        #[arg(long)]
        expect_plan: Option<String>,
    },
    /// List dependencies recorded in an environment, or all environments.
    List {
        #[arg(long)]
        env: Option<String>,
    },
    /// Check backend tools and configuration.
    Doctor,
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
    /// Generate man pages into a directory.
    ManPages {
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("HATCH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let json_output = cli.json;
    let home = match cli.home.map_or_else(hatch_home, Ok) {
        Ok(home) => home,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let result = match cli.command {
        Commands::Plan { package } => commands::plan::run(&home, &package, json_output),
        Commands::Install {
            package,
            env,
            yes,
            no,
            dry_run,
            jobs,
            timeout,
            expect_plan,
        } => commands::install::run(
            &home,
            &package,
            &commands::install::InstallArgs {
                env,
                yes,
                no,
                dry_run,
                jobs,
                timeout,
                expect_plan,
            },
            json_output,
        ),
        Commands::List { env } => commands::list::run(&home, env.as_deref(), json_output),
        Commands::Doctor => commands::doctor::run(&home, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("declaration error:")
        || msg.starts_with("plan construction failed:")
        || msg.starts_with("dependency resolution failed:")
        || msg.starts_with("plan fingerprint mismatch")
    {
        EXIT_PLAN_ERROR
    } else if msg.starts_with("installation not approved:") {
        EXIT_CONSENT_DENIED
    } else {
        EXIT_FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exit_codes_follow_error_class() {
        assert_eq!(exit_code_for("declaration error: bad json"), EXIT_PLAN_ERROR);
        assert_eq!(
            exit_code_for("dependency resolution failed: cycle a -> a"),
            EXIT_PLAN_ERROR
        );
        assert_eq!(
            exit_code_for("installation not approved: declined by user"),
            EXIT_CONSENT_DENIED
        );
        assert_eq!(exit_code_for("store lock: busy"), EXIT_FAILURE);
    }

    #[test]
    fn yes_and_no_conflict() {
        let err = Cli::try_parse_from(["hatch", "install", "--yes", "--no"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }
}
