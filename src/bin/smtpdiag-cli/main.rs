mod args;
mod message;
mod output;
mod run;

use anyhow::Result;

use crate::args::{Cli, Commands};

// codes de sortie : 0 aucun problème, 2 interférence ou indéterminé, 1 fatal
fn main() -> Result<()> {
    let cli = Cli::parse();
    run::init_tracing(cli.verbose);

    let code = match &cli.cmd {
        Commands::Diagnose(args) => run::diagnose(args, &cli)?,
        Commands::Probe(args) => run::probe(args, &cli)?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
