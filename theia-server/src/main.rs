#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use theia::store::file::FileStore;
use theia::store::relational::RelationalStore;
use theia::{Broker, Collector, EventStore};

use theia_server::config::{Cli, StoreKind};
use theia_server::gelf::{GelfLevel, GelfLogger};
use theia_server::server::ServerState;
use theia_server::supervisor;

fn main() {
    let cli = Cli::parse();

    let gelf = cli.gelf_addr.as_deref().map(|addr| {
        let logger = Arc::new(GelfLogger::new(addr).expect("failed to create GELF logger"));
        eprintln!("GELF logging: enabled ({addr})");
        logger.send(GelfLevel::Informational, &format!("GELF logging: enabled ({addr})"), &[]);
        logger
    });

    if cli.verbose {
        eprintln!("verbose: enabled");
    }

    let store: Arc<dyn EventStore> = match cli.store {
        StoreKind::File => {
            let store = FileStore::open_with_width(&cli.data_dir, cli.bucket_width)
                .expect("failed to open file store");
            eprintln!("store: file (data_dir={}, bucket_width={}s)", cli.data_dir, cli.bucket_width);
            Arc::new(store)
        }
        StoreKind::Rdbs => {
            let url = cli
                .database_url
                .as_deref()
                .expect("--database-url is required when --store rdbs");
            let store = RelationalStore::open(url).expect("failed to open relational store");
            eprintln!("store: rdbs (database_url={url})");
            Arc::new(store)
        }
    };

    let broker = Arc::new(Broker::new(Duration::from_millis(cli.write_timeout_ms)));
    let collector = Arc::new(Collector::new(store, broker));

    let state = Arc::new(ServerState {
        collector,
        live_buffer: 256,
        gelf,
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    runtime.block_on(async move {
        if let Err(e) = supervisor::run(cli, state).await {
            eprintln!("fatal server error: {e}");
            std::process::exit(1);
        }
    });
}
