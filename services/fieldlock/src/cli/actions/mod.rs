pub mod server;

use anyhow::Result;

/// What the parsed command line asked the binary to do.
pub enum Action {
    Run(Box<server::Args>),
}

impl Action {
    /// # Errors
    /// Propagates the server's startup or runtime error.
    pub async fn execute(self) -> Result<()> {
        match self {
            Self::Run(args) => server::start(*args).await,
        }
    }
}
