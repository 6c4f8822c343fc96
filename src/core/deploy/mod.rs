//! Deployment pipeline: validate, test, back up, build, apply, migrate, verify.
//!
//! A failure after the environment has been touched rolls back to the backup
//! anchor and the previously deployed version.

pub mod controller;
pub mod health;
pub mod lock;
pub mod notify;
pub mod platform;
pub mod run;

pub use controller::{Collaborators, Controller, ControllerSettings, DeployRequest};
pub use health::{HealthProbe, HttpProbe, RetryPolicy};
pub use lock::{EnvironmentLock, LockHolder};
pub use notify::{Notifier, WebhookNotifier};
pub use platform::{KubePlatform, Platform};
pub use run::{
    DeploymentRun, RollbackRecord, RunFlags, RunMode, RunStatus, RunStore, Stage, StageOutcome,
    StageRecord,
};
