use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;
use crate::shutdown::ShutdownCoordinator;

pub mod cache;
pub mod fetch;
pub mod listener;
pub mod request;
mod resolver;
pub mod response;
pub mod stream;

use cache::CacheDirectory;

/// Shared state handed to every connection task.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub directory: CacheDirectory,
    pub shutdown: ShutdownCoordinator,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        directory: CacheDirectory,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            settings,
            directory,
            shutdown,
        }
    }
}

/// Bind the configured listen address and run the accept loop until shutdown.
pub async fn run(app: AppContext) -> Result<()> {
    let listener = listener::bind(app.settings.listen).await?;
    listener::serve(listener, app).await
}
