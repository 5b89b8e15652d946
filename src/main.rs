mod config;
mod decoder;
mod error;
mod gc;
mod json;
mod normalize;
mod system_info;

use std::env::args;

use jane_eyre::eyre::{self, bail, OptionExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> eyre::Result<()> {
    jane_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive("gcdecode=info".parse()?)
                .from_env_lossy(),
        )
        .init();

    let mode = args()
        .nth(1)
        .ok_or_eyre("Usage: gcdecode <decode|clock> ...")?;
    let args = args().skip(2).collect::<Vec<_>>();

    match &*mode {
        // Usage: gcdecode decode <systeminfo.json> <traceevent.json> [--config <gcdecode.toml>]
        "decode" => crate::decoder::main(args),
        // Usage: gcdecode clock <systeminfo.json>
        "clock" => crate::system_info::main(args),
        other => bail!("Unknown command: {other}"),
    }
}
