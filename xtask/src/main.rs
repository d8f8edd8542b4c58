use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build {
        /// Use asynchronous pipe I/O for the bulk test
        #[arg(long)]
        async_io: bool,
    },
    /// Run the notifier
    Run {
        /// Use asynchronous pipe I/O for the bulk test
        #[arg(long)]
        async_io: bool,
        /// Arguments passed through to ezusb-notify
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Test the workspace in both bulk test modes
    Test,
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build { async_io } => {
            println!("Building project...");
            let mut args = vec!["build"];
            if *async_io {
                args.extend(["-p", "ezusb-cli", "--features", "async-io"]);
            }
            cargo(&args, "Build")?;
        }
        Commands::Run { async_io, args } => {
            println!("Running notifier...");
            let mut cmd = vec!["run", "-p", "ezusb-cli"];
            if *async_io {
                cmd.extend(["--features", "async-io"]);
            }
            cmd.push("--");
            cmd.extend(args.iter().map(String::as_str));
            cargo(&cmd, "Run")?;
        }
        Commands::Test => {
            println!("Testing (sync bulk I/O)...");
            cargo(&["test", "--workspace"], "Test")?;
            println!("Testing (async bulk I/O)...");
            cargo(&["test", "-p", "ezusb-core", "--features", "async-io"], "Test")?;
        }
    }

    Ok(())
}
