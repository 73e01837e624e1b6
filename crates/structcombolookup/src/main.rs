use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use rusqlite::Connection;
use structcombolookup_core::config::{PluginConfig, load_config};
use structcombolookup_core::hooks::{ComboLookupPlugin, HookOutcome, HostEvent, MigrationStatus};
use structcombolookup_core::lookup::TypeRegistry;
use structcombolookup_core::migrate::{
    ColumnMigration, MIGRATION_FLAG, MigrationOutcome, plan_migration, run_migration,
};
use structcombolookup_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, inspect_runtime, normalize_for_display,
    resolve_paths,
};
use structcombolookup_core::store::open_connection;
use structcombolookup_core::substitute::{FormField, TemplateSaveEvent, load_struct_field};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "structcombolookup",
    version,
    about = "ComboLookup/NarrowingLookup maintenance for a DokuWiki struct database"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    wiki_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Enable debug logging on stderr")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    wiki_root: Option<PathBuf>,
    db: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            wiki_root: cli.wiki_root.clone(),
            db: cli.db.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Show migration state and pending lookup rewrites")]
    Status(StatusArgs),
    #[command(about = "Rewrite legacy lookup values into the composite encoding")]
    Migrate(MigrateArgs),
    #[command(about = "Fire the struct type class init hook")]
    Init,
    #[command(about = "Resolve narrowing lookup substitutions for form fields")]
    Substitute(SubstituteArgs),
    #[command(about = "List the host events this plugin hooks into")]
    Hooks,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long, help = "Print the plan as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, help = "Only count the values that would be rewritten")]
    dry_run: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct SubstituteArgs {
    #[arg(
        long = "field",
        value_name = "TABLE.LABEL=VALUE",
        required = true,
        help = "Submitted struct field value (repeatable)"
    )]
    fields: Vec<String>,
    #[arg(long, value_name = "PATH", help = "Template to render with the substitutions")]
    template: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Status(args)) => run_status(&runtime, args),
        Some(Commands::Migrate(args)) => run_migrate(&runtime, args),
        Some(Commands::Init) => run_init(&runtime),
        Some(Commands::Substitute(args)) => run_substitute(&runtime, args),
        Some(Commands::Hooks) => run_hooks(),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("STRUCTCOMBOLOOKUP_LOG").unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("structcombolookup=debug,structcombolookup_core=debug,info")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_status(runtime: &RuntimeOptions, args: StatusArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let status = inspect_runtime(&paths)?;

    if !status.db_exists {
        println!("lookup status");
        println!("db_path: {}", normalize_for_display(&paths.db_path));
        println!("db_exists: no");
        for warning in &status.warnings {
            println!("warning: {warning}");
        }
        bail!("cannot inspect lookup migration without a struct database");
    }

    let connection = open_store(&paths, &config)?;
    let plan = plan_migration(&connection)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("lookup status");
    println!("wiki_root: {}", normalize_for_display(&paths.wiki_root));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("run_on_init: {}", format_flag(config.migration.run_on_init));
    println!("{MIGRATION_FLAG}: {}", format_flag(plan.migrated));
    println!("schemas: {}", plan.schemas_scanned);
    if !plan.migrated {
        println!("pending_values: {}", plan.pending_values());
        print_columns("pending", &plan.columns);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_migrate(runtime: &RuntimeOptions, args: MigrateArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let mut connection = open_store(&paths, &config)?;

    if args.dry_run {
        let plan = plan_migration(&connection)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
            return Ok(());
        }
        println!("lookup migrate (dry run)");
        println!("db_path: {}", normalize_for_display(&paths.db_path));
        println!("already_migrated: {}", format_flag(plan.migrated));
        println!("pending_values: {}", plan.pending_values());
        print_columns("pending", &plan.columns);
        return Ok(());
    }

    let outcome = run_migration(&mut connection)
        .with_context(|| format!("lookup migration failed for {}", paths.db_path.display()))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    println!("lookup migrate");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    match outcome {
        MigrationOutcome::AlreadyMigrated => println!("status: already migrated"),
        MigrationOutcome::Migrated(report) => {
            println!("status: migrated");
            println!("schemas: {}", report.schemas_scanned);
            println!("rewritten_values: {}", report.rewritten_values());
            print_columns("migrated", &report.columns);
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_init(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let mut connection = open_store(&paths, &config)?;
    let plugin = ComboLookupPlugin::new(&config);
    let mut registry = TypeRegistry::new();

    let outcome = plugin.handle(&mut connection, HostEvent::TypeClassInit(&mut registry))?;
    println!("type class init");
    if let HookOutcome::TypeClassesRegistered(status) = &outcome {
        match status {
            MigrationStatus::Disabled => println!("migration: disabled"),
            MigrationStatus::Finished(MigrationOutcome::AlreadyMigrated) => {
                println!("migration: already migrated")
            }
            MigrationStatus::Finished(MigrationOutcome::Migrated(report)) => {
                println!("migration: migrated ({} values)", report.rewritten_values())
            }
            MigrationStatus::Failed(err) => println!("migration: failed ({err:#})"),
        }
    }
    for (class, identifier) in &registry {
        println!("type.{class}: {identifier}");
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_substitute(runtime: &RuntimeOptions, args: SubstituteArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let mut connection = open_store(&paths, &config)?;

    let mut fields = Vec::with_capacity(args.fields.len());
    for spec in &args.fields {
        let (table, label, value) = parse_field_spec(spec)?;
        match load_struct_field(&connection, table, label, value)? {
            Some(field) => fields.push(FormField::Struct(field)),
            None => {
                println!("field.unknown: {table}.{label}");
                fields.push(FormField::Other {
                    label: label.to_string(),
                });
            }
        }
    }

    let plugin = ComboLookupPlugin::new(&config);
    let mut event = TemplateSaveEvent::new(fields);
    plugin.handle(&mut connection, HostEvent::TemplateSave(&mut event))?;

    println!("substitutions.count: {}", event.substitutions.len());
    for (key, pattern, value) in event.substitutions.iter() {
        println!("substitution.{key}: {value}");
        println!("pattern.{key}: {}", pattern.as_str());
    }
    if let Some(template_path) = &args.template {
        let template = fs::read_to_string(template_path)
            .with_context(|| format!("failed to read {}", template_path.display()))?;
        println!();
        print!("{}", event.substitutions.apply(&template));
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_hooks() -> Result<()> {
    let plugin = ComboLookupPlugin::new(&PluginConfig::default());
    for hook in plugin.registrations() {
        println!("hook: {} {}", hook.event, hook.advise);
    }
    Ok(())
}

fn parse_field_spec(spec: &str) -> Result<(&str, &str, &str)> {
    let Some((target, value)) = spec.split_once('=') else {
        bail!("field must look like TABLE.LABEL=VALUE: {spec}");
    };
    let Some((table, label)) = target.trim().split_once('.') else {
        bail!("field must look like TABLE.LABEL=VALUE: {spec}");
    };
    if table.is_empty() || label.is_empty() {
        bail!("field must look like TABLE.LABEL=VALUE: {spec}");
    }
    Ok((table, label, value))
}

fn print_columns(prefix: &str, columns: &[ColumnMigration]) {
    if columns.is_empty() {
        println!("{prefix}.columns: <none>");
        return;
    }
    for column in columns {
        println!(
            "{prefix}.{}.col{} ({} {}): pages={} rows={} multi_pages={} multi_rows={}",
            column.table,
            column.colref,
            column.kind,
            column.label,
            column.data_pages,
            column.data_rows,
            column.multi_pages,
            column.multi_rows
        );
    }
}

fn resolve_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, PluginConfig)> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        wiki_root: runtime.wiki_root.clone(),
        db_path: runtime.db.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let wiki_env = initial.wiki_root.join(".env");
    if wiki_env.exists() {
        let _ = dotenvy::from_path_override(&wiki_env);
    }

    let mut paths = resolve_paths(&context, &overrides)?;
    let config = load_config(&paths.config_path)?;
    paths.apply_config(&config);
    debug!(
        wiki_root = %normalize_for_display(&paths.wiki_root),
        db_path = %normalize_for_display(&paths.db_path),
        db_source = paths.db_source.as_str(),
        "resolved runtime paths"
    );
    Ok((paths, config))
}

fn open_store(paths: &ResolvedPaths, config: &PluginConfig) -> Result<Connection> {
    open_connection(&paths.db_path, config.busy_timeout())
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
