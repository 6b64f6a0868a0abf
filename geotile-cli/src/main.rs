mod show;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "geotile")]
#[command(about = "Feature-store tile tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a tile blob and summarize its contents
    Show(show::Args),
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger from RUST_LOG environment variable
    // Example: RUST_LOG=debug geotile show ...
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Show(args) => show::run(args),
    }
}
