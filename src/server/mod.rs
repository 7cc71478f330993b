pub mod api;
pub mod websocket;

use crate::agent::EcgAgent;
use crate::cli::Args;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    addr: String,
    agent: Arc<EcgAgent>,
    args: Args,
}

impl Server {
    pub fn new(addr: String, agent: Arc<EcgAgent>, args: Args) -> Self {
        Self { addr, agent, args }
    }

    /// The HTTP server runs in the background; the WebSocket accept loop
    /// runs until it fails.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(self.args.http_port, self.agent.clone(), self.args.clone()).await?;

        websocket::start_ws_server(
            &self.addr,
            self.agent.clone(),
            self.args.server_api_key.clone(),
            self.args.clone()
        ).await
    }
}
