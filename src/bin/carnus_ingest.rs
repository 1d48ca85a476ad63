#![deny(warnings)]

use {anyhow::Result, carnus_ingest::Options, std::process, structopt::StructOpt};

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init_timed();

    let summary = carnus_ingest::run(&Options::from_args()).await?;

    if summary.failed > 0 {
        process::exit(1);
    }

    Ok(())
}
