use anyhow::Result;
use clap::{Parser, Subcommand};
use classroom_monitor::monitor::{MonitorCliArgs, MonitorConfig};

#[derive(Parser)]
#[command(name = "classroom-monitor", version, about = "Live classroom emotion monitor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture, analyse, and serve the preview until Ctrl+C.
    Run(MonitorCliArgs),
    /// List camera indices that open.
    Probe {
        #[arg(long, default_value_t = 10)]
        max: i32,
    },
}

pub fn handle_commands(args: &[String]) -> Result<()> {
    let cli = Cli::try_parse_from(args).unwrap_or_else(|err| err.exit());
    match cli.command {
        Command::Run(args) => run_monitor(MonitorConfig::try_from(args)?),
        Command::Probe { max } => probe(max),
    }
}

#[cfg(feature = "opencv")]
fn run_monitor(config: MonitorConfig) -> Result<()> {
    classroom_monitor::monitor::run(config, video_ingest::OpenCvBackend::new())
}

#[cfg(not(feature = "opencv"))]
fn run_monitor(_config: MonitorConfig) -> Result<()> {
    anyhow::bail!("camera capture requires building with `--features opencv`")
}

#[cfg(feature = "opencv")]
fn probe(max: i32) -> Result<()> {
    use video_ingest::DeviceBackend;

    let found = video_ingest::OpenCvBackend::new().probe(max);
    if found.is_empty() {
        println!("No cameras found in 0..{max}");
    }
    for index in found {
        println!("camera #{index}");
    }
    Ok(())
}

#[cfg(not(feature = "opencv"))]
fn probe(_max: i32) -> Result<()> {
    anyhow::bail!("camera probing requires building with `--features opencv`")
}
