mod args;
mod config;

use log::{debug, error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::process;

use lvmcore::lock::{LockClient, LockMode, LockRequest};
use lvmcore::metadata::pv::PhysicalVolume;
use lvmcore::metadata::segment::SegmentType;
use lvmcore::metadata::vg::{LvCreateParams, VolumeGroup};
use lvmcore::uuid::Uuid;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    env_logger::init();
    info!("starting lvmcore-demo v{}", VERSION);

    let mut signals = Signals::new([SIGINT, SIGTERM]).expect("cannot init signal handler");
    std::thread::spawn(move || {
        for sig in signals.forever() {
            warn!("received signal {:?}, demo has nothing to flush, exiting", sig);
            process::exit(0);
        }
    });

    let args = args::parse();
    debug!("args: {:?}", args);

    let config = config::load(args.config_path.clone()).unwrap_or_else(|err| {
        debug!("no usable config at {} ({}), using defaults", args.config_path, err);
        config::Config::default()
    });
    debug!("config: {:?}", config);

    match args.command {
        args::Command::DemoVg {
            name,
            extent_size,
            pv_size_sectors,
        } => demo_vg(&name, extent_size, pv_size_sectors),
        args::Command::DemoLock { vg_name } => demo_lock(&vg_name, config.lvmlockd_lock_retries),
    }
}

fn demo_vg(name: &str, extent_size: u64, pv_size_sectors: u64) {
    let mut vg = VolumeGroup::new(name, extent_size);
    let pv = PhysicalVolume::create(Uuid::generate(), pv_size_sectors, extent_size);
    if let Err(err) = vg.extend(pv) {
        error!("vg_extend failed: {}", err);
        process::exit(1);
    }

    let free = vg.free_count();
    match vg.lv_create_single(LvCreateParams {
        name: "data".to_string(),
        extents: free / 2,
        seg_type: SegmentType::Linear,
        stripe_size: None,
    }) {
        Ok(id) => info!("vg {}: created lv data ({})", vg.name, id),
        Err(err) => {
            error!("lv_create_single failed: {}", err);
            process::exit(1);
        }
    }

    match vg.check_invariants() {
        Ok(()) => info!(
            "vg {}: invariants hold ({} extents, {} free)",
            vg.name,
            vg.extent_count(),
            vg.free_count()
        ),
        Err(msg) => {
            error!("vg invariants violated: {}", msg);
            process::exit(1);
        }
    }
}

fn demo_lock(vg_name: &str, retries: u32) {
    use lvmcore::lock::client::MockTransport;
    use lvmcore::lock::ResultFlags;

    let mut transport = MockTransport::new();
    transport.push_reply(0, ResultFlags::empty());
    let mut client = LockClient::new(transport, retries);
    let req = LockRequest::new("lock_vg", vg_name, LockMode::Ex);
    match client.request(&req) {
        Ok(outcome) => info!("vg {}: lock request granted ({:?})", vg_name, outcome),
        Err(err) => {
            error!("lock request failed: {}", err);
            process::exit(1);
        }
    }
}
