use clap::Parser;
use tapnet::{
    config::{Config, ConfigArgs},
    Emulator, RunSummary,
};

type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

async fn run(config: Config) -> Result<(), DynError> {
    let emulator = Emulator::build(&config)?;

    println!("Created {} nodes", emulator.node_count());
    println!("Installed CSMA attachments on all nodes");
    println!("Connecting tap devices to CSMA attachments...");
    for node in emulator.registry().iter() {
        println!(
            "Connecting {} to node {}",
            node.interface(),
            node.endpoint().index()
        );
    }
    println!("All tap devices connected successfully");

    let stop = emulator.stop_handle();
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received, stopping after in-flight events");
        stop.stop();
    })?;

    println!(
        "Starting simulation for {} seconds...",
        config.duration.as_secs_f64()
    );
    let summary = emulator.run().await?;
    println!("Simulation completed successfully");
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Dispatched events: {}", summary.run.dispatched);
    println!(
        "Frames bridged in: {}, out: {}",
        summary.bridges.frames_in, summary.bridges.frames_out
    );
    println!(
        "Transmissions: {}, collisions: {}, frames dropped: {}",
        summary.channel.transmissions, summary.channel.collisions, summary.channel.frames_dropped
    );
    println!(
        "Queue overflow drops: {}, delivery drops: {}",
        summary.bridges.ingest_overflow, summary.bridges.egress_drops
    );
    println!(
        "Worst drift behind wall clock: {}us over {} late dispatches",
        summary.run.drift.worst_nanos / 1_000,
        summary.run.drift.late_dispatches
    );
}

fn main() -> Result<(), DynError> {
    let args = ConfigArgs::parse();
    tapnet::config::set_logger(
        args.verbose
            .then_some(tracing::level_filters::LevelFilter::DEBUG),
    );
    let config = args.build()?;

    println!("Multi-Node Tap-CSMA Scenario");
    println!("Number of nodes: {}", config.nodes);
    println!("Tap prefix: {}", config.prefix);
    println!("Simulation time: {} seconds", config.duration.as_secs_f64());
    println!("CSMA data rate: {}", config.data_rate);
    println!("CSMA delay: {}", config.delay);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(run(config))?;
    Ok(())
}
