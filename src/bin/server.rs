use clap::Parser;
use kvfront::config::WritePolicy;
use kvfront::processor::KvProcessor;
use kvfront::{logging, Config, Server};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8888)]
    port: u16,

    /// IPv4 bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Number of dispatch loops (0 = number of CPUs)
    #[arg(short = 't', long, default_value_t = 1)]
    threads: usize,

    /// Processor worker threads (0 = run requests on the dispatch loop)
    #[arg(long, default_value_t = 0)]
    processor_threads: usize,

    /// Readiness events handled per wait
    #[arg(long, default_value_t = 8)]
    max_events: usize,

    /// Per-read buffer size; larger requests are split
    #[arg(long, default_value_t = 512)]
    buffer_size: usize,

    /// Listen backlog
    #[arg(long, default_value_t = 16)]
    backlog: u32,

    /// What to do when a response does not fit in one write
    #[arg(long, value_enum, default_value_t = WritePolicy::Retry)]
    write_policy: WritePolicy,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also append logs to this file
    #[arg(long)]
    log_file: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Create configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        let threads = if args.threads == 0 {
            num_cpus::get()
        } else {
            args.threads
        };
        Config {
            bind_addr: args.bind,
            port: args.port,
            threads,
            processor_threads: args.processor_threads,
            max_events: args.max_events,
            buffer_size: args.buffer_size,
            backlog: args.backlog,
            write_policy: args.write_policy,
            log_level: args.log_level,
            log_file: args.log_file,
            ..Default::default()
        }
    };

    // Initialize tracing
    let log_level = if args.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    logging::init(log_level, config.log_file.as_deref().map(Path::new))?;

    info!(
        "Starting kvfront v{} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.bind_addr,
        config.port
    );

    let processor = Arc::new(KvProcessor::new(config.max_memory)?);
    let server = Arc::new(Server::bind(config, processor)?);

    // Setup signal handlers for graceful shutdown
    let server_clone = Arc::clone(&server);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, shutting down gracefully...");
        server_clone.shutdown();
    })?;

    // Run the server
    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
