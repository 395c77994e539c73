use std::sync::Arc;

use clap::Parser;
use token_place_relay::{config::RelayConfig, telemetry, RelayContext};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = RelayConfig::parse();
    telemetry::init(&config.log_filter, config.log_format == "json");

    if let Err(err) = config.production_checks() {
        error!(%err, "refusing to start with an insecure configuration");
        std::process::exit(3);
    }

    let ctx = match RelayContext::new(config) {
        Ok(ctx) => Arc::new(ctx),
        Err(err) => {
            error!(%err, "failed to initialize crypto backend");
            std::process::exit(2);
        }
    };

    info!(
        bind = %ctx.config.bind_addr(),
        public_url = %ctx.config.public_url,
        "relayd starting"
    );

    ctx.spawn_reaper();

    if let Err(err) = token_place_relay::http::serve(ctx).await {
        error!(%err, "relay exited with an error");
        std::process::exit(1);
    }
}
