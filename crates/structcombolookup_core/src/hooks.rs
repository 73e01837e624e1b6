//! Host event surface of the plugin.

use anyhow::Result;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::config::PluginConfig;
use crate::lookup::{TypeRegistry, register_type_classes};
use crate::migrate::{MigrationOutcome, run_migration};
use crate::substitute::{TemplateSaveEvent, resolve_narrowing_fields};

pub const TYPECLASS_INIT_EVENT: &str = "PLUGIN_STRUCT_TYPECLASS_INIT";
pub const TEMPLATE_SAVE_EVENT: &str = "PLUGIN_BUREAUCRACY_TEMPLATE_SAVE";

/// Both handlers run before the host's own processing.
pub const ADVISE_BEFORE: &str = "BEFORE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookRegistration {
    pub event: &'static str,
    pub advise: &'static str,
}

pub const HOOKS: [HookRegistration; 2] = [
    HookRegistration {
        event: TYPECLASS_INIT_EVENT,
        advise: ADVISE_BEFORE,
    },
    HookRegistration {
        event: TEMPLATE_SAVE_EVENT,
        advise: ADVISE_BEFORE,
    },
];

#[derive(Debug)]
pub enum HostEvent<'a> {
    TypeClassInit(&'a mut TypeRegistry),
    TemplateSave(&'a mut TemplateSaveEvent),
}

impl HostEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TypeClassInit(_) => TYPECLASS_INIT_EVENT,
            Self::TemplateSave(_) => TEMPLATE_SAVE_EVENT,
        }
    }
}

#[derive(Debug)]
pub enum MigrationStatus {
    Disabled,
    Finished(MigrationOutcome),
    /// Rolled back; the next init retries.
    Failed(anyhow::Error),
}

#[derive(Debug)]
pub enum HookOutcome {
    TypeClassesRegistered(MigrationStatus),
    SubstitutionsAdded(usize),
}

#[derive(Debug, Clone)]
pub struct ComboLookupPlugin {
    run_migration_on_init: bool,
}

impl ComboLookupPlugin {
    pub fn new(config: &PluginConfig) -> Self {
        Self {
            run_migration_on_init: config.migration.run_on_init,
        }
    }

    pub fn registrations(&self) -> &'static [HookRegistration] {
        &HOOKS
    }

    pub fn handle(&self, connection: &mut Connection, event: HostEvent<'_>) -> Result<HookOutcome> {
        match event {
            HostEvent::TypeClassInit(registry) => {
                let status = self.migrate_on_init(connection);
                register_type_classes(registry);
                Ok(HookOutcome::TypeClassesRegistered(status))
            }
            HostEvent::TemplateSave(template) => {
                let added = resolve_narrowing_fields(connection, template)?;
                Ok(HookOutcome::SubstitutionsAdded(added))
            }
        }
    }

    // Type registration must not depend on the migration succeeding.
    fn migrate_on_init(&self, connection: &mut Connection) -> MigrationStatus {
        if !self.run_migration_on_init {
            return MigrationStatus::Disabled;
        }
        match run_migration(connection) {
            Ok(outcome) => {
                if let MigrationOutcome::Migrated(report) = &outcome {
                    info!(
                        rewritten = report.rewritten_values(),
                        "lookup values migrated during type class init"
                    );
                }
                MigrationStatus::Finished(outcome)
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "lookup migration failed; will retry on next init");
                MigrationStatus::Failed(err)
            }
        }
    }
}
