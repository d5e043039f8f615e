mod cli;
mod core;
mod interfaces;
mod logging;

fn main() {
    // The runtime is built by hand so the blocking pool honors
    // LOOPFACTORY_TO_THREAD_WORKERS.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(crate::core::scheduler::worker_pool_size())
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(cli::run_main()) {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}
