use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::Cli;
use crate::gelf::GelfLevel;
use crate::server::{self, ServerState};

/// Bind the listener, accept connections in a loop, and flush the store on
/// `ctrl_c` (spec §2, §4.6).
pub async fn run(cli: Cli, state: Arc<ServerState>) -> std::io::Result<()> {
    let addr = cli.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    let msg = format!(
        "theia-collector listening on {addr} (store={:?}, data_dir={}, write_timeout_ms={})",
        cli.store, cli.data_dir, cli.write_timeout_ms
    );
    eprintln!("{msg}");
    if let Some(gelf) = &state.gelf {
        gelf.send(GelfLevel::Notice, &msg, &[]);
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            server::handle_connection(stream, state).await;
                        });
                    }
                    Err(e) => {
                        eprintln!("accept error: {e}");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("shutdown signal received, flushing store");
                if let Err(e) = state.collector.close() {
                    eprintln!("error flushing store on shutdown: {e}");
                }
                return Ok(());
            }
        }
    }
}
