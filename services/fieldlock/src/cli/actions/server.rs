use anyhow::Result;

use crate::api::{self, ServerConfig};

pub struct Args {
    pub config: ServerConfig,
}

/// Run the HTTP server until shutdown.
///
/// # Errors
/// Propagates startup and runtime failures from the API layer.
pub async fn start(args: Args) -> Result<()> {
    api::serve(args.config).await
}
