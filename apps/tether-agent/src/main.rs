use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = tether_agent::Args::parse();

	tether_agent::run(args).await
}
