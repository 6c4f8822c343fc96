use clap::Args;

use hubctl::backup::storage;
use hubctl::deploy::{
    Collaborators, Controller, ControllerSettings, DeployRequest, DeploymentRun, HttpProbe,
    KubePlatform, Notifier, RunFlags, RunMode, WebhookNotifier,
};
use hubctl::environment::Environment;
use hubctl::git::GitWorkspace;
use hubctl::paths;
use hubctl::testing::TestOrchestrator;

use super::{BackupTooling, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct DeployArgs {
    /// Target environment (development, staging, production)
    #[arg(long, value_parser = super::parse_environment)]
    env: Environment,

    /// Version to deploy (defaults to the HEAD commit)
    #[arg(long)]
    version: Option<String>,

    /// Do not run the test gate
    #[arg(long)]
    skip_tests: bool,

    /// Do not take a pre-deploy backup (no rollback anchor)
    #[arg(long)]
    skip_backup: bool,

    /// Continue past backup and health-check failures and production branch checks
    #[arg(long)]
    force: bool,

    /// Validate, then describe every stage without performing it
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
pub struct RollbackArgs {
    /// Target environment
    #[arg(long, value_parser = super::parse_environment)]
    env: Environment,

    /// Previously published version to revert to
    #[arg(long)]
    version: String,

    /// Validate, then describe every stage without performing it
    #[arg(long)]
    dry_run: bool,
}

pub fn run(args: DeployArgs, global: &GlobalArgs) -> CmdResult<DeploymentRun> {
    let request = DeployRequest {
        version: args.version,
        mode: RunMode::Deploy,
        flags: RunFlags {
            skip_tests: args.skip_tests,
            skip_backup: args.skip_backup,
            force: args.force,
            dry_run: args.dry_run,
        },
    };
    execute(args.env, request, global)
}

pub fn run_rollback(args: RollbackArgs, global: &GlobalArgs) -> CmdResult<DeploymentRun> {
    let request = DeployRequest {
        version: Some(args.version),
        mode: RunMode::Rollback,
        flags: RunFlags {
            dry_run: args.dry_run,
            ..RunFlags::default()
        },
    };
    execute(args.env, request, global)
}

fn execute(env: Environment, request: DeployRequest, global: &GlobalArgs) -> CmdResult<DeploymentRun> {
    let config = &global.config;
    let profile = super::resolve_profile(env, global)?;

    let source = GitWorkspace::current_dir()?;
    let tests = TestOrchestrator::new(config);
    let tooling = BackupTooling::from_config(config)?;
    let backups = tooling.engine();
    let platform = KubePlatform::new(config.deploy.clone(), config.timeouts.clone());
    let probe = HttpProbe::new(config.timeouts.probe_secs)?;
    let webhook =
        WebhookNotifier::from_env_or(config.deploy.notify_webhook.as_deref(), config.timeouts.probe_secs)?;

    let mut settings = ControllerSettings::from_config(config, paths::locks()?, paths::runs(env.as_str())?);
    settings.backup_options.remote_bucket =
        storage::resolve_bucket(None, config.backup.s3_bucket.as_deref());

    let controller = Controller::new(
        Collaborators {
            source: &source,
            tests: &tests,
            backups: &backups,
            platform: &platform,
            probe: &probe,
            notifier: webhook.as_ref().map(|w| w as &dyn Notifier),
        },
        settings,
    );

    let run = controller.run(&profile, request)?;
    Ok((run, 0))
}
