//! Demo worker. Launched by the host with `SERVICELINK_ARGUMENT` set.

use std::process;

fn main() {
    servicelink::logging::init_tracing();

    if let Err(e) = servicelink_demo::demo_runtime().run() {
        tracing::error!(error = %e, "Worker failed");
        eprintln!("error: {e}");
        process::exit(1);
    }
}
