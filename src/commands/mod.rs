use hubctl::backup::{AwsCli, BackupEngine, BackupSettings, PgTools};
use hubctl::config::{self, HubConfig};
use hubctl::environment::{self, Environment, EnvironmentProfile};

pub type CmdResult<T> = hubctl::Result<(T, i32)>;

pub(crate) struct GlobalArgs {
    pub config: HubConfig,
}

pub mod backup;
pub mod backups;
pub mod deploy;
pub mod restore;
pub mod status;
pub mod verify;

/// clap value parser for `--env`, accepting the short aliases too.
pub fn parse_environment(value: &str) -> Result<Environment, String> {
    value.parse::<Environment>().map_err(|e| e.message)
}

pub(crate) fn resolve_profile(environment: Environment, global: &GlobalArgs) -> hubctl::Result<EnvironmentProfile> {
    environment::resolve(environment, &global.config)
}

/// Concrete database and object-store tooling for the backup engine.
pub(crate) struct BackupTooling {
    db: PgTools,
    store: AwsCli,
    settings: BackupSettings,
}

impl BackupTooling {
    pub fn from_config(config: &HubConfig) -> hubctl::Result<Self> {
        Ok(Self {
            db: PgTools::from_timeouts(&config.timeouts),
            store: AwsCli::from_timeouts(&config.timeouts),
            settings: BackupSettings::from_config(config)?,
        })
    }

    pub fn engine(&self) -> BackupEngine<'_> {
        BackupEngine::new(&self.db, &self.store, self.settings.clone())
    }
}

macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(command: crate::Commands) -> (hubctl::Result<serde_json::Value>, i32) {
    crate::tty::status("hubctl is working...");

    let global = match config::load() {
        Ok(config) => GlobalArgs { config },
        Err(err) => return crate::output::map_cmd_result_to_json::<serde_json::Value>(Err(err)),
    };

    match command {
        crate::Commands::Backup(args) => dispatch!(args, &global, backup),
        crate::Commands::Restore(args) => dispatch!(args, &global, restore),
        crate::Commands::Test(args) => dispatch!(args, &global, test),
        crate::Commands::Deploy(args) => dispatch!(args, &global, deploy),
        crate::Commands::Rollback(args) => {
            crate::output::map_cmd_result_to_json(deploy::run_rollback(args, &global))
        }
        crate::Commands::Backups(args) => dispatch!(args, &global, backups),
        crate::Commands::Verify(args) => dispatch!(args, &global, verify),
        crate::Commands::Status(args) => dispatch!(args, &global, status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parser_accepts_aliases() {
        assert_eq!(parse_environment("prod").unwrap(), Environment::Production);
        assert_eq!(parse_environment("Staging").unwrap(), Environment::Staging);
        assert!(parse_environment("qa").unwrap_err().contains("qa"));
    }
}
