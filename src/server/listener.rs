//! TCP listener and accept loop

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::broker::SharedBroker;
use crate::error::Result;
use crate::server::connection;

/// The broker's TCP front end
pub struct Server {
    listener: TcpListener,
    broker: SharedBroker,
}

impl Server {
    /// Bind the listener on the configured address. Stores recover before
    /// this point, so a bound server is ready to serve immediately.
    pub async fn bind(broker: SharedBroker) -> Result<Self> {
        let address = broker.config().server.address();
        let listener = TcpListener::bind(&address).await?;
        info!(address = %listener.local_addr()?, "broker listening");
        Ok(Self { listener, broker })
    }

    /// Actual bound address (differs from config when port 0 is used)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails. Each connection gets
    /// its own task; a connection error never takes down the accept loop.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let broker = self.broker.clone();
            tokio::spawn(async move {
                if let Err(e) = connection::serve(broker, stream, peer).await {
                    error!(%peer, error = %e, "connection terminated with error");
                }
            });
        }
    }
}
