use clap::Parser;
use log::{debug, LevelFilter};
use miette::Result;
use uf2batch::{
    cli::{config::Config, flash_batch, FlashArgs},
    logging::initialize_logger,
};

#[derive(Debug, Parser)]
#[clap(about, version)]
struct Cli {
    #[clap(flatten)]
    flash_args: FlashArgs,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let args = Cli::parse().flash_args;
    debug!("{:#?}", args);

    // Load any user configuration, if present.
    let config = Config::load()?;

    flash_batch(args, &config).await
}
