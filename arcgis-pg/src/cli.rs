//! Définition et implémentation des commandes CLI
//!
//! - `describe` : schéma d'une couche distante
//! - `import` : création d'une table et chargement complet
//! - `reload` : remplacement du contenu d'une table
//! - `append` : ajout des features plus récentes que la table
//! - `refresh` : rechargement de toutes les couches importées

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use deadpool_postgres::Pool;
use tracing::{info, warn};

use arcgis::{ArcGisClient, ClientConfig, LayerService, MapperOptions, TypeMapper};
use arcgis_pg::config::ImportConfig;
use arcgis_pg::export::pool::{create_pool, test_connection, DatabaseConfig};
use arcgis_pg::job::{ImportMode, ImportService, PgJobStore};
use arcgis_pg::publish::NoopPublisher;
use arcgis_pg::report::ImportReport;

#[derive(Subcommand)]
pub enum Commands {
    /// Show the schema of a remote layer
    Describe {
        /// Layer URL (…/MapServer/<id> or …/FeatureServer/<id>)
        url: String,

        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Create a table from a remote layer and load every feature
    Import {
        url: String,

        /// Destination table (défaut : nom de la couche)
        #[arg(short, long)]
        table: Option<String>,

        /// Replace the table if it exists
        #[arg(long)]
        overwrite: bool,

        /// Create a session-scoped temporary table
        #[arg(long)]
        temporary: bool,

        /// Keep field names as published by the service
        #[arg(long)]
        no_launder: bool,

        /// Geometry column name
        #[arg(long)]
        geometry_column: Option<String>,

        /// Owner role of the created table
        #[arg(long)]
        owner: Option<String>,

        /// JSON import config (command line options take precedence)
        #[arg(long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        load: LoadArgs,

        #[command(flatten)]
        service: ServiceArgs,

        #[command(flatten)]
        db: DbArgs,
    },

    /// Replace the content of an imported table
    Reload {
        url: String,

        #[arg(short, long)]
        table: String,

        #[command(flatten)]
        load: LoadArgs,

        #[command(flatten)]
        service: ServiceArgs,

        #[command(flatten)]
        db: DbArgs,
    },

    /// Append features newer than the table content
    Append {
        url: String,

        #[arg(short, long)]
        table: String,

        /// Remote date field compared with the table maximum
        #[arg(long)]
        update_field: String,

        #[command(flatten)]
        load: LoadArgs,

        #[command(flatten)]
        service: ServiceArgs,

        #[command(flatten)]
        db: DbArgs,
    },

    /// Reload every tracked layer
    Refresh {
        #[command(flatten)]
        service: ServiceArgs,

        #[command(flatten)]
        db: DbArgs,
    },
}

/// Options communes aux chargements
#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Target PostgreSQL schema
    #[arg(long, default_value = "public")]
    pub schema: String,

    /// Roll back when the feature stream stops early
    #[arg(long)]
    pub strict: bool,

    /// Features requested per page
    #[arg(long)]
    pub page_size: Option<u32>,

    /// Reproject locally instead of asking the service (outSR)
    #[arg(long)]
    pub client_reprojection: bool,

    /// Write the JSON report to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

/// Accès au service ArcGIS
#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    /// ArcGIS token (défaut : env ARCGIS_TOKEN)
    #[arg(long)]
    pub token: Option<String>,

    /// HTTP timeout in seconds
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,
}

/// Connexion PostgreSQL et publication
#[derive(Args, Debug, Clone)]
pub struct DbArgs {
    /// PostgreSQL host (défaut : env PGHOST / localhost)
    #[arg(long)]
    pub host: Option<String>,

    /// PostgreSQL database name (défaut : env PGDATABASE / gis)
    #[arg(long)]
    pub database: Option<String>,

    /// PostgreSQL user (défaut : env PGUSER / postgres)
    #[arg(long)]
    pub user: Option<String>,

    /// PostgreSQL password (défaut : env PGPASSWORD)
    #[arg(long)]
    pub password: Option<String>,

    /// PostgreSQL port (défaut : env PGPORT / 5432)
    #[arg(long)]
    pub port: Option<u16>,

    /// SSL mode: disable, prefer, require (défaut : env PGSSLMODE / disable)
    #[arg(long)]
    pub ssl: Option<String>,

    /// Schema holding the job tables
    #[arg(long, default_value = "public")]
    pub jobs_schema: String,

    /// Base URL of the published layers
    #[arg(long, default_value = "http://localhost")]
    pub site_url: String,
}

fn make_client(args: &ServiceArgs) -> Result<ArcGisClient> {
    let config = ClientConfig {
        timeout_secs: args.timeout,
        token: args
            .token
            .clone()
            .or_else(|| std::env::var("ARCGIS_TOKEN").ok()),
        ..ClientConfig::default()
    };
    ArcGisClient::new(config).context("Failed to create ArcGIS client")
}

fn apply_database_overrides(args: &DbArgs) -> Result<DatabaseConfig> {
    let mut config = DatabaseConfig::from_env();
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(database) = &args.database {
        config.dbname = database.clone();
    }
    if let Some(user) = &args.user {
        config.user = user.clone();
    }
    if let Some(password) = &args.password {
        config.password = Some(password.clone());
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ssl) = &args.ssl {
        config.ssl_mode = ssl.parse().map_err(anyhow::Error::msg)?;
    }
    Ok(config)
}

fn apply_load_args(config: &mut ImportConfig, load: &LoadArgs) {
    config.schema = Some(load.schema.clone());
    config.strict |= load.strict;
    config.client_side_reprojection |= load.client_reprojection;
    if let Some(page_size) = load.page_size {
        config.page_size = page_size;
    }
}

async fn make_service(
    service: &ServiceArgs,
    db: &DbArgs,
) -> Result<ImportService<Pool>> {
    let client = make_client(service)?;
    let db_config = apply_database_overrides(db)?;
    info!(
        host = %db_config.host,
        port = db_config.port,
        database = %db_config.dbname,
        "Connecting to PostgreSQL"
    );
    let pool = create_pool(&db_config)?;
    test_connection(&pool).await?;

    let jobs = PgJobStore::new(pool.clone(), db.jobs_schema.clone());
    jobs.ensure_tables()
        .await
        .context("Failed to create job tables")?;

    Ok(ImportService::new(
        Arc::new(client),
        pool,
        Arc::new(jobs),
        Arc::new(NoopPublisher::new(db.site_url.clone())),
    ))
}

fn finish_report(report: &ImportReport, path: Option<&PathBuf>) -> Result<()> {
    report.display();
    if let Some(path) = path {
        report.save_to_file(path)?;
        info!(path = %path.display(), "Report saved");
    }
    if !report.is_success() {
        bail!("Import failed: {}", report.last_message);
    }
    Ok(())
}

async fn run_job(
    service: &ImportService<Pool>,
    url: &str,
    config: &ImportConfig,
    mode: ImportMode,
    report_path: Option<&PathBuf>,
) -> Result<()> {
    let id = service.create_import_job(url, config, mode).await?;
    match service.run_import_job(id).await? {
        Some(report) => finish_report(&report, report_path),
        None => bail!("Job {} was taken by another worker", id),
    }
}

/// Exécute la commande describe
pub async fn cmd_describe(url: &str, service: &ServiceArgs) -> Result<()> {
    let client = make_client(service)?;
    let descriptor = client.describe(url).await?;

    println!("Layer: {} ({:?})", descriptor.name, descriptor.kind);
    println!("Table name: {}", descriptor.layer_name());
    if let Some(geometry) = &descriptor.geometry_type {
        println!("Geometry: {}", geometry);
    }
    println!("Spatial reference: {:?}", descriptor.spatial_reference);
    println!(
        "Pagination: {}, max records: {}",
        descriptor.supports_pagination, descriptor.max_record_count
    );

    let mapper = TypeMapper::new(&descriptor, MapperOptions::default());
    println!("\nColumns:");
    for column in mapper.columns()? {
        println!("  {:<30} {:?} <- {}", column.name, column.column_type, column.source);
    }
    Ok(())
}

/// Exécute la commande import
#[allow(clippy::too_many_arguments)]
pub async fn cmd_import(
    url: &str,
    table: Option<String>,
    overwrite: bool,
    temporary: bool,
    no_launder: bool,
    geometry_column: Option<String>,
    owner: Option<String>,
    config_path: Option<&PathBuf>,
    load: &LoadArgs,
    service: &ServiceArgs,
    db: &DbArgs,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => ImportConfig::load(path)?,
        None => ImportConfig::default(),
    };
    apply_load_args(&mut config, load);
    if table.is_some() {
        config.table_name = table;
    }
    config.overwrite |= overwrite;
    config.temporary |= temporary;
    if no_launder {
        config.launder_names = false;
    }
    if let Some(column) = geometry_column {
        config.geometry_column = column;
    }
    if owner.is_some() {
        config.owner = owner;
    }
    if config.temporary {
        warn!("Temporary tables disappear with the import connection");
    }

    let service = make_service(service, db).await?;
    run_job(&service, url, &config, ImportMode::Full, load.report.as_ref()).await
}

/// Exécute la commande reload
pub async fn cmd_reload(
    url: &str,
    table: &str,
    load: &LoadArgs,
    service: &ServiceArgs,
    db: &DbArgs,
) -> Result<()> {
    let mut config = ImportConfig::builder().table_name(table).build()?;
    apply_load_args(&mut config, load);

    let service = make_service(service, db).await?;
    run_job(&service, url, &config, ImportMode::Reload, load.report.as_ref()).await
}

/// Exécute la commande append
pub async fn cmd_append(
    url: &str,
    table: &str,
    update_field: &str,
    load: &LoadArgs,
    service: &ServiceArgs,
    db: &DbArgs,
) -> Result<()> {
    let mut config = ImportConfig::builder()
        .table_name(table)
        .update_field(update_field)
        .build()?;
    apply_load_args(&mut config, load);

    let service = make_service(service, db).await?;
    run_job(&service, url, &config, ImportMode::Append, load.report.as_ref()).await
}

/// Exécute la commande refresh
pub async fn cmd_refresh(service: &ServiceArgs, db: &DbArgs) -> Result<()> {
    let service = make_service(service, db).await?;
    let reports = service.refresh_imported_layers().await?;

    println!("\n--- REFRESH ---");
    for report in &reports {
        println!("  {}", report.summary());
    }
    let failed = reports.iter().filter(|r| !r.is_success()).count();
    if failed > 0 {
        bail!("{} of {} layers failed to refresh", failed, reports.len());
    }
    Ok(())
}
