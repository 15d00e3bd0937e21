use chrono::Local;
use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod image;
mod model;
mod operator;
mod orchestrator;

use config::Settings;
use image::ContainerEngine;
use model::TerminalStatus;
use operator::KubeClient;
use orchestrator::{Error, LifecycleOrchestrator};

#[derive(Parser)]
#[command(name = "tls-scanner-deployer")]
#[command(bin_name = "tls-scanner-deployer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Runs full-deploy when omitted
    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand, Clone, Copy)]
enum Action {
    /// Build the scanner image
    Build,
    /// Push the scanner image to its registry
    Push,
    /// Grant permissions, provision the pull secret and submit the Job
    Deploy,
    /// Remove the Job, revoke permissions and unlink the pull secret
    Cleanup,
    /// Build, push and deploy, stopping at the first failure
    FullDeploy,
    /// Same as full-deploy; cleanup stays manual
    Default,
    /// Wait for the submitted Job to finish
    Monitor(MonitorArgs),
    /// Print the lifecycle state inferred from the cluster
    Status,
    /// Print the rendered Job manifest without applying it
    Render,
}

impl Action {
    fn label(&self) -> &'static str {
        match self {
            Action::Build => "build",
            Action::Push => "push",
            Action::Deploy => "deploy",
            Action::Cleanup => "cleanup",
            Action::FullDeploy => "full-deploy",
            Action::Default => "default",
            Action::Monitor(_) => "monitor",
            Action::Status => "status",
            Action::Render => "render",
        }
    }
}

#[derive(Args, Clone, Copy)]
struct MonitorArgs {
    /// Seconds to wait; overrides --timeout-secs
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let action = cli.action.unwrap_or(Action::Default);
    let config = Arc::new(cli.settings.into_configuration());
    let images = Arc::new(ContainerEngine::new(&config.container_engine));
    let orchestrator = LifecycleOrchestrator::new(config.clone(), Arc::new(KubeClient::new()), images);

    match run(&orchestrator, action, config.wait_timeout).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            banner(&e, action);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(
    orchestrator: &LifecycleOrchestrator,
    action: Action,
    wait_timeout: Duration,
) -> Result<(), Error> {
    match action {
        Action::Build => orchestrator.build().await,
        Action::Push => orchestrator.push().await,
        Action::Deploy => {
            let handle = orchestrator.deploy().await?;
            println!("Submitted {}", handle);
            Ok(())
        }
        Action::FullDeploy => {
            let handle = orchestrator.full_deploy().await?;
            println!("Submitted {}", handle);
            Ok(())
        }
        Action::Default => {
            let handle = orchestrator.full_deploy().await?;
            println!("Submitted {}", handle);
            println!(
                "Cleanup is not automatic: run `tls-scanner-deployer cleanup` once results \
                 have been collected"
            );
            Ok(())
        }
        Action::Cleanup => cleanup(orchestrator).await,
        Action::Monitor(args) => {
            let timeout = args.timeout.map(Duration::from_secs).unwrap_or(wait_timeout);
            match orchestrator.monitor(timeout).await? {
                TerminalStatus::Complete => {
                    println!("Workload complete; results are ready to collect");
                    Ok(())
                }
                TerminalStatus::Failed => Err(Error::WorkloadFailed(
                    "the scanner Job reported a Failed condition".into(),
                )),
            }
        }
        Action::Status => {
            let state = orchestrator.state().await?;
            println!("{}: {}", state, state.message());
            Ok(())
        }
        Action::Render => {
            print!("{}", orchestrator.render().await?);
            Ok(())
        }
    }
}

async fn cleanup(orchestrator: &LifecycleOrchestrator) -> Result<(), Error> {
    match orchestrator.cleanup().await {
        Ok(report) => {
            println!(
                "Cleanup finished: {} step(s) completed, none failed",
                report.completed.len()
            );
            Ok(())
        }
        Err(Error::AggregateTeardown(failures)) => {
            println!("Cleanup finished with {} failed step(s):", failures.len());
            for failure in &failures {
                println!("  - {}", failure);
            }
            Err(Error::AggregateTeardown(failures))
        }
        Err(e) => Err(e),
    }
}

/// The failing step when one is known, otherwise the action itself.
fn failure_label(e: &Error, action: Action) -> String {
    match e.failing_step() {
        Some(step) => step.to_string(),
        None => action.label().to_string(),
    }
}

fn banner(e: &Error, action: Action) {
    let label = failure_label(e, action);
    error!("{} failed: {}", label, e);
    eprintln!(
        "!!! [{}] FAILED at {}: {}",
        Local::now().format("%H:%M:%S"),
        label,
        e
    );
    info!("Exiting with status {}", e.exit_code());
}
