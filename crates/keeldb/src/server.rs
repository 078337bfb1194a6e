use anyhow::Result;
use pgsrv::Handler;
use sqlengine::Engine;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info};

pub struct ServerConfig {
    pub pg_listener: TcpListener,
}

pub struct Server {
    pg_handler: Arc<Handler>,
}

impl Server {
    /// Bootstraps the server, loading the catalog before any connection is
    /// accepted.
    pub fn connect(engine: Arc<Engine>) -> Result<Server> {
        engine.ensure_catalog_ready()?;
        Ok(Server {
            pg_handler: Arc::new(Handler::new(engine)),
        })
    }

    /// Serve using the provided config.
    pub async fn serve(self, conf: ServerConfig) -> Result<()> {
        info!("keeldb listening...");

        loop {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("shutting down");
                    return Ok(());
                }

                result = conf.pg_listener.accept() => {
                    let (conn, client_addr) = result?;

                    let pg_handler = self.pg_handler.clone();
                    tokio::spawn(async move {
                        debug!(%client_addr, "client connected (pg)");
                        match pg_handler.handle_connection(conn).await {
                            Ok(_) => debug!(%client_addr, "client disconnected"),
                            Err(e) => error!(%e, %client_addr, "client disconnected with error"),
                        }
                    });
                }
            }
        }
    }
}
