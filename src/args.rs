use clap::Parser;

pub fn parse() -> Args {
    Args::parse()
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
pub struct Args {
    #[arg(long = "config", short = 'c', default_value_t = String::from("/etc/lvmcore/config.json"))]
    pub config_path: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Parser, Debug)]
pub enum Command {
    /// Create a VG from one PV and print its invariants.
    DemoVg {
        #[arg(long, default_value_t = String::from("demo"))]
        name: String,
        #[arg(long, default_value_t = 4096)]
        extent_size: u64,
        #[arg(long, default_value_t = 1_000_000)]
        pv_size_sectors: u64,
    },
    /// Exercise the lock client's request state machine against a mock reply.
    DemoLock {
        #[arg(long, default_value_t = String::from("myvg"))]
        vg_name: String,
    },
}
