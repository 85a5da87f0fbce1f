use clap::Parser;
use vqpress::cli::SubCommandExtend;
use vqpress::config::{Opts, SubCommand};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();
    match &opts.subcmd {
        SubCommand::Compress(cmd) => cmd.run(&opts),
        SubCommand::Inspect(cmd) => cmd.run(&opts),
    }
}
