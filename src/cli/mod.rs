use std::path::PathBuf;

use anyhow::Result;
use console::style;

use crate::core::config;
use crate::core::store::Store;
use crate::core::supervisor::Supervisor;
use crate::interfaces::web::ApiServer;

fn print_help() {
    println!(
        "\n {} — supervisor for a fleet of CLI-driven agents\n",
        style("loopfactory").green().bold()
    );
    println!(" {}", style("Commands").bold());
    println!(
        "   {}    Run the supervisor and HTTP API",
        style("serve").cyan()
    );
    println!(
        "   {}  Create or upgrade the database schema",
        style("migrate").cyan()
    );
    println!("   {}     Show this help", style("help").cyan());
    println!(
        "\n {} loopfactory serve [--home DIR] [--api-host HOST] [--api-port PORT]",
        style("Usage:").bold()
    );
    println!("        loopfactory migrate [--home DIR]\n");
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|index| args.get(index + 1))
        .cloned()
}

fn home_from_args(args: &[String]) -> PathBuf {
    parse_flag(args, "--home")
        .map(PathBuf::from)
        .unwrap_or_else(config::home_dir)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("serve") => serve(&args[2..]).await,
        Some("migrate") => migrate(&args[2..]).await,
        Some("help") | Some("--help") | Some("-h") | None => {
            print_help();
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(2);
        }
    }
}

async fn serve(args: &[String]) -> Result<()> {
    crate::logging::init();
    let home = home_from_args(args);
    tokio::fs::create_dir_all(&home).await?;

    let supervisor = Supervisor::build(&home).await?;
    supervisor.start().await?;

    let dashboard = supervisor.config.get().dashboard;
    let api_host =
        parse_flag(args, "--api-host").unwrap_or_else(|| "127.0.0.1".to_string());
    let api_port = parse_flag(args, "--api-port")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(dashboard.api_port);

    let server = ApiServer::new(supervisor.clone(), api_host, api_port);
    server
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    supervisor.stop().await?;
    Ok(())
}

async fn migrate(args: &[String]) -> Result<()> {
    let home = home_from_args(args);
    let db_path = home.join("data").join("mcn.db");
    // Opening the store runs the additive migrations and seeds.
    let store = Store::open(&db_path).await?;
    println!(
        "Database ready at {}",
        style(store.db_path().display()).cyan()
    );
    Ok(())
}
