use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rdt_vision::PipelineConfig;

use crate::replay::{self, ReplayCliArgs, ReplayConfig};

#[derive(Debug, Parser)]
#[command(name = "rdt-reader", version, about = "Rapid diagnostic test strip reader")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replay a recorded scanning session through the pipeline.
    Replay(ReplayCliArgs),
    /// Print the default pipeline configuration as JSON.
    DefaultConfig,
}

pub fn handle_command(command: Command) -> Result<()> {
    match command {
        Command::Replay(args) => {
            let config = ReplayConfig::try_from(args)?;
            replay::run(config)
        }
        Command::DefaultConfig => {
            let rendered = serde_json::to_string_pretty(&PipelineConfig::default())
                .context("serialising default configuration")?;
            writeln!(io::stdout().lock(), "{rendered}").context("writing to stdout")?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_replay_subcommand() {
        let cli = Cli::try_parse_from([
            "rdt-reader",
            "replay",
            "frames",
            "--manifest",
            "session.json",
            "--rotation",
            "90",
        ])
        .unwrap();
        let Command::Replay(args) = cli.command else {
            panic!("expected replay subcommand");
        };
        assert_eq!(args.frames.to_str(), Some("frames"));
        assert_eq!(args.rotation, Some(90));
    }
}
