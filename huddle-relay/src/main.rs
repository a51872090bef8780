//! `Huddle` development server.
//!
//! An axum server holding channels and messages in memory, for running the
//! `huddle` client locally.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000 with demo users alice, bob, carol
//! cargo run --bin huddle-relay -- --demo
//!
//! # Run on custom address
//! cargo run --bin huddle-relay -- --bind 127.0.0.1:8080
//! ```

use std::sync::Arc;

use clap::Parser;
use huddle_proto::ids::{ChannelId, UserId};
use huddle_relay::config::{DemoSeed, RelayCliArgs, RelayConfig};
use huddle_relay::server;
use huddle_relay::state::RelayState;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting huddle relay server");

    let state = Arc::new(RelayState::new().with_max_page_size(config.max_page_size));
    if let Some(seed) = &config.demo {
        seed_demo(&state, seed).await;
    }

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}

/// Seeds demo users, the group channel and one direct channel per pair
/// with the first user.
async fn seed_demo(state: &RelayState, seed: &DemoSeed) {
    let users: Vec<UserId> = (1..).map(UserId).take(seed.usernames.len()).collect();
    for (user, name) in users.iter().zip(&seed.usernames) {
        state.store.set_username(*user, name).await;
        tracing::info!(user_id = %user, username = %name, "demo user");
    }
    state
        .seed_channel(ChannelId(1), &seed.group_name, false, &users)
        .await;

    if let Some((first, rest)) = users.split_first() {
        for (other, name) in rest.iter().zip(seed.usernames.iter().skip(1)) {
            state
                .seed_channel(
                    ChannelId(seed.direct_channel_base + other.get()),
                    name,
                    true,
                    &[*first, *other],
                )
                .await;
        }
    }
}
