use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::{Config, StoreBackend};
use crate::flags::flag_service::FlagService;
use crate::flags::flag_store::{FlagStore, MemoryFlagStore};
use crate::flags::pg_store::PgFlagStore;
use crate::router;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let store: Arc<dyn FlagStore + Send + Sync> = match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory flag store, flags will not survive a restart");
            Arc::new(MemoryFlagStore::new())
        }
        StoreBackend::Postgres => match PgFlagStore::new(
            &config.database_url,
            config.max_pg_connections,
            config.store_timeout(),
        )
        .await
        {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!("Failed to create flag store: {}", e);
                return;
            }
        },
    };

    let app = router::router(FlagService::new(store), config);

    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(e) => tracing::warn!("listening on unknown address: {}", e),
    }
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("server error: {}", e);
    }
}
