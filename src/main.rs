mod analyse;
mod batch;
mod category;
mod config;
mod error;
mod interval;
mod json;
mod model;
mod report;
mod score;
mod summary;
#[cfg(test)]
mod test_util;

use std::env::args;

use jane_eyre::eyre::{self, bail, OptionExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> eyre::Result<()> {
    jane_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive("scripting_time=info".parse()?)
                .from_env_lossy(),
        )
        .init();

    let mode = args()
        .nth(1)
        .ok_or_eyre("Usage: scripting-time <batch|trace> ...")?;
    let args = args().skip(2).collect::<Vec<_>>();

    match &*mode {
        // Usage: scripting-time batch <batch.toml>
        "batch" => crate::batch::main(args),
        // Usage: scripting-time trace <trace.json ...>
        "trace" => crate::analyse::main(args),
        other => bail!("Unknown command: {other}"),
    }
}
