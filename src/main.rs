use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tunecheck::cluster::{self, setup_client};
use tunecheck::executor::{DaemonPodExecutor, DaemonTarget, LocalExecutor, NodeExecutor};
use tunecheck::formatters::*;
use tunecheck::irqbalance::{IrqBalanceSuite, Scenario};
use tunecheck::latency::{self, LatencyState};
use tunecheck::models::*;
use tunecheck::node_selector::pick_node;
use tunecheck::node_state::NodeInspector;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker role whose nodes are tuned by the profile (default: $ROLE_WORKER_CNF or worker-cnf)
    #[arg(long, global = true)]
    role: Option<String>,

    /// Node to verify (default: $E2E_PAO_TARGET_NODE, else the first candidate)
    #[arg(long, global = true)]
    node: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser)]
enum Commands {
    /// Verify irqbalance CPU ban list handling on a tuned node
    Irqbalance {
        /// Output format (json, yaml, table, markdown)
        #[arg(short, long, default_value = "table")]
        format: String,

        /// Scenario to run, repeatable (default: all)
        #[arg(short, long)]
        scenario: Vec<Scenario>,

        /// Container image for the test pod
        #[arg(long, default_value = DEFAULT_TEST_IMAGE)]
        image: String,

        /// Namespace for the test pod
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },
    /// Prepare, run and clean up the latency tests
    Latency {
        #[command(subcommand)]
        action: LatencyCommand,
    },
    /// Print the CPU ban list of a node
    BannedCpus {
        /// Run commands locally instead of through the machine-config-daemon pod
        #[arg(long)]
        local: bool,

        /// Where the node filesystem is visible with --local
        #[arg(long, default_value = "/")]
        host_root: String,
    },
    /// Print the IRQ-related state of a node
    NodeState {
        /// Output format (json, yaml, table, markdown)
        #[arg(short, long, default_value = "table")]
        format: String,

        /// Run commands locally instead of through the machine-config-daemon pod
        #[arg(long)]
        local: bool,

        /// Where the node filesystem is visible with --local
        #[arg(long, default_value = "/")]
        host_root: String,
    },
    /// Print the node the suites would verify
    SelectNode,
}

#[derive(Parser)]
enum LatencyCommand {
    /// Repartition the profile CPUs and prepull the test image
    Setup {
        /// Save what teardown must undo to this file
        #[arg(long, default_value = "latency-state.json")]
        save_to: PathBuf,

        /// Latency test executable that must be present before setup
        #[arg(long, default_value = DEFAULT_TEST_EXECUTABLE)]
        executable: PathBuf,

        #[arg(long, default_value = DEFAULT_TEST_IMAGE)]
        image: String,
    },
    /// Setup, run the latency test executable, then tear down
    Run {
        /// Output format (json, yaml, table, markdown)
        #[arg(short, long, default_value = "table")]
        format: String,

        /// Latency test executable
        #[arg(long, default_value = DEFAULT_TEST_EXECUTABLE)]
        executable: PathBuf,

        #[arg(long, default_value = DEFAULT_TEST_IMAGE)]
        image: String,

        /// Keep the profile and prepull namespace after the run (for debugging)
        #[arg(long)]
        no_cleanup: bool,

        /// Arguments passed to the test executable
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Restore the profile and remove the prepull namespace
    Teardown {
        /// State file written by setup
        #[arg(long, default_value = "latency-state.json")]
        load_from: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut config = HarnessConfig::from_env();
    if let Some(role) = args.role {
        config.role = role;
    }
    if args.node.is_some() {
        config.target_node = args.node;
    }

    match args.command {
        Commands::Irqbalance {
            format,
            scenario,
            image,
            namespace,
        } => {
            config.test_image = image;
            config.test_namespace = namespace;
            let scenarios = if scenario.is_empty() {
                Scenario::ALL.to_vec()
            } else {
                scenario
            };
            run_irqbalance(config, &scenarios, &format).await
        }
        Commands::Latency { action } => run_latency(config, action).await,
        Commands::BannedCpus { local, host_root } => {
            let (inspector, node) = node_inspector(&config, local, host_root).await?;
            let banned = inspector.banned_cpus(&node).await?;
            println!("{}", banned);
            Ok(())
        }
        Commands::NodeState {
            format,
            local,
            host_root,
        } => {
            let (inspector, node) = node_inspector(&config, local, host_root).await?;
            let state = inspector.snapshot(&node).await?;
            let output = get_formatter(&format).format_node_state(&state)?;
            print_output(&format, &output);
            Ok(())
        }
        Commands::SelectNode => {
            let (client, _) = setup_client().await?;
            let node = select_target(&client, &config).await?;
            println!("{}", node);
            Ok(())
        }
    }
}

async fn run_irqbalance(config: HarnessConfig, scenarios: &[Scenario], format: &str) -> Result<()> {
    info!("Starting irqbalance verification...");
    let (client, kube_config) = setup_client().await?;
    let api_server_url = kube_config.cluster_url.to_string();

    let suite = IrqBalanceSuite::new(client, config, Some(api_server_url));
    let report = suite.run(scenarios).await;
    finish(&report, format)
}

async fn run_latency(mut config: HarnessConfig, action: LatencyCommand) -> Result<()> {
    match action {
        LatencyCommand::Setup {
            save_to,
            executable,
            image,
        } => {
            config.test_executable = executable;
            config.test_image = image;
            latency::ensure_test_executable(&config.test_executable)?;
            let (client, _) = setup_client().await?;
            let state = latency::setup(&client, &config).await?;
            state.save_to(&save_to)
        }
        LatencyCommand::Run {
            format,
            executable,
            image,
            no_cleanup,
            args,
        } => {
            config.test_executable = executable;
            config.test_image = image;
            if no_cleanup {
                config.cleanup_mode = CleanupMode::NoCleanup;
            }
            let (client, kube_config) = setup_client().await?;
            let api_server_url = kube_config.cluster_url.to_string();
            let report = latency::run(&client, &config, Some(api_server_url), &args).await?;
            finish(&report, &format)
        }
        LatencyCommand::Teardown { load_from } => {
            let state = LatencyState::load_from(&load_from)?;
            let (client, _) = setup_client().await?;
            latency::teardown(&client, &config, &state).await
        }
    }
}

async fn select_target(client: &kube::Client, config: &HarnessConfig) -> Result<NodeRef> {
    let nodes = cluster::nodes_by_labels(client, &config.node_selector_labels()).await?;
    let candidates = cluster::node_refs(&nodes);
    Ok(pick_node(&candidates, config.target_node.as_deref())?.clone())
}

async fn node_inspector(
    config: &HarnessConfig,
    local: bool,
    host_root: String,
) -> Result<(NodeInspector, NodeRef)> {
    if local {
        let node = NodeRef::new(config.target_node.clone().unwrap_or_else(|| "local".to_string()));
        let executor: Arc<dyn NodeExecutor> = Arc::new(LocalExecutor::new(host_root));
        return Ok((NodeInspector::new(executor), node));
    }

    let (client, _) = setup_client().await?;
    let node = select_target(&client, config).await?;
    let executor: Arc<dyn NodeExecutor> = Arc::new(DaemonPodExecutor::new(
        client,
        DaemonTarget::machine_config_daemon(),
    ));
    Ok((NodeInspector::new(executor), node))
}

fn print_output(format: &str, output: &str) {
    if format == "table" {
        print!("{}", output);
    } else {
        println!("{}", output);
    }
}

fn finish(report: &SuiteReport, format: &str) -> Result<()> {
    let formatter = get_formatter(format);
    let output = formatter.format_report(report)?;
    print_output(format, &output);

    let passed = report.count(ScenarioStatus::Passed);
    let failed = report.count(ScenarioStatus::Failed);
    let skipped = report.count(ScenarioStatus::Skipped);
    if format == "table" {
        println!(
            "{} passed, {} failed, {} skipped",
            passed.green(),
            failed.red(),
            skipped.yellow()
        );
    }

    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}
