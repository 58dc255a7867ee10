use clap::Parser;

use hwstress::config::Args;
use hwstress::controller::Sat;
use hwstress::util;

fn main() {
    let args = Args::parse();
    util::logging(args.verbosity, args.logfile.as_deref());

    // 255 marks a failure to even construct the test; 0/1 report the run.
    let mut sat = match Sat::new(args) {
        Ok(sat) => sat,
        Err(e) => {
            log::error!("failed to construct the test: {e}");
            std::process::exit(255);
        }
    };
    std::process::exit(sat.run());
}
