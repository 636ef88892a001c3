//! Custard gateway server entry point

use anyhow::Result;
use clap::Parser;
use custard::auth::HttpIdentityProvider;
use custard::blob::HttpBlobStore;
use custard::config::GatewayConfig;
use custard::context::{Collaborators, GatewayContext};
use custard::llm::HttpLanguageModel;
use custard::server;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "custard", about = "Natural-language query gateway")]
struct Args {
    /// Use the production configuration preset
    #[arg(long)]
    production: bool,

    /// Listener address override
    #[arg(long)]
    bind: Option<String>,

    /// Application database URL override
    #[arg(long, env = "CUSTARD_DATABASE_URL")]
    database_url: Option<String>,

    /// LLM API key
    #[arg(long, env = "CUSTARD_LLM_API_KEY")]
    llm_api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("custard=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = if args.production {
        GatewayConfig::production()
    } else {
        GatewayConfig::development()
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }
    if let Some(api_key) = args.llm_api_key {
        config.llm.api_key = api_key;
    }
    config.validate()?;

    let collaborators = Collaborators {
        llm: Arc::new(HttpLanguageModel::new(&config.llm)),
        identity: Arc::new(HttpIdentityProvider::new(&config.identity_base_url)),
        blob: Arc::new(HttpBlobStore::new(&config.blob_base_url)),
    };
    let ctx = GatewayContext::new(config, collaborators).await?;

    // Collaborator reachability is a startup gate; failure is fatal.
    ctx.startup_checks().await?;

    let (listener, addr) = server::bind(&ctx).await?;
    info!(%addr, "custard gateway listening");

    let serving = {
        let ctx = ctx.clone();
        tokio::spawn(async move { server::serve(ctx, listener).await })
    };

    tokio::signal::ctrl_c().await?;
    ctx.shutdown();
    serving.await??;

    info!("custard gateway stopped");
    Ok(())
}
