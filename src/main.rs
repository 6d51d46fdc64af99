use clap::Parser;

use rdrs::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    rdrs::init_tracing(args.verbose);

    if let Err(err) = rdrs::run(args).await {
        tracing::error!("{:#}", err);
        std::process::exit(1);
    }
    Ok(())
}
