mod compress;
mod inspect;

pub use compress::*;
pub use inspect::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> anyhow::Result<()>;
}
