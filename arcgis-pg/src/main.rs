//! Point d'entrée CLI pour arcgis-pg

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

// Charger .env au démarrage
fn load_env() {
    if dotenvy::dotenv().is_err() {
        // Essayer depuis le répertoire du binaire
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let _ = dotenvy::from_path(dir.join(".env"));
            }
        }
    }
}

mod cli;

use cli::Commands;

/// Importer des couches ArcGIS REST dans PostGIS
#[derive(Parser)]
#[command(name = "arcgis-pg")]
#[command(author, version)]
#[command(about = "Import ArcGIS MapServer / FeatureServer layers into PostGIS")]
#[command(long_about = "Import ArcGIS REST feature layers into PostGIS tables.\n\nA full import creates the table, reload replaces its content in one transaction and append only loads features newer than the table content.")]
struct Cli {
    /// Augmenter la verbosité (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Mode silencieux
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();

    let cli = Cli::parse();

    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Describe { url, service } => {
            cli::cmd_describe(&url, &service).await?;
        }
        Commands::Import {
            url,
            table,
            overwrite,
            temporary,
            no_launder,
            geometry_column,
            owner,
            config,
            load,
            service,
            db,
        } => {
            info!(url = %url, table = ?table, "Import into PostGIS");
            cli::cmd_import(
                &url,
                table,
                overwrite,
                temporary,
                no_launder,
                geometry_column,
                owner,
                config.as_ref(),
                &load,
                &service,
                &db,
            )
            .await?;
        }
        Commands::Reload {
            url,
            table,
            load,
            service,
            db,
        } => {
            info!(url = %url, table = %table, "Reload table");
            cli::cmd_reload(&url, &table, &load, &service, &db).await?;
        }
        Commands::Append {
            url,
            table,
            update_field,
            load,
            service,
            db,
        } => {
            info!(url = %url, table = %table, update_field = %update_field, "Append to table");
            cli::cmd_append(&url, &table, &update_field, &load, &service, &db).await?;
        }
        Commands::Refresh { service, db } => {
            info!("Refresh imported layers");
            cli::cmd_refresh(&service, &db).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Level::WARN,
        (_, 0) => Level::INFO,
        (_, 1) => Level::DEBUG,
        (_, _) => Level::TRACE,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .init();
}
