//! Server plumbing
//!
//! Bind/serve split so tests can run the gateway on an ephemeral port, plus
//! graceful shutdown driven by the context's cancellation token.

use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::api::create_app;
use crate::context::GatewayContext;

/// Binds the configured listener and returns its actual address
///
/// # Errors
///
/// Returns an error if the address cannot be parsed or bound.
pub async fn bind(ctx: &GatewayContext) -> std::io::Result<(TcpListener, SocketAddr)> {
    let addr: SocketAddr = ctx
        .config
        .bind_addr
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let listener = TcpListener::bind(addr).await?;
    let actual = listener.local_addr()?;
    Ok((listener, actual))
}

/// Serves the gateway until the shutdown token fires, then drains
///
/// # Errors
///
/// Returns an error if the server fails while running.
pub async fn serve(ctx: Arc<GatewayContext>, listener: TcpListener) -> std::io::Result<()> {
    let token = ctx.shutdown_token();
    let app: Router = create_app(ctx);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticIdentityProvider;
    use crate::blob::MemoryBlobStore;
    use crate::config::GatewayConfig;
    use crate::context::Collaborators;
    use crate::llm::MockLanguageModel;

    #[tokio::test]
    async fn binds_on_an_ephemeral_port() {
        let ctx = GatewayContext::new(
            GatewayConfig::testing(),
            Collaborators {
                llm: Arc::new(MockLanguageModel::new()),
                identity: Arc::new(StaticIdentityProvider::new()),
                blob: Arc::new(MemoryBlobStore::new()),
            },
        )
        .await
        .unwrap();

        let (listener, addr) = bind(&ctx).await.unwrap();
        assert_ne!(addr.port(), 0);
        drop(listener);
    }
}
