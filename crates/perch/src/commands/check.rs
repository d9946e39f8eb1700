//! Configuration check command implementation.

use std::path::Path;

use anyhow::Result;

use perch::config::{self, Config};

/// Load the configuration, resolve derived paths, and print the result.
///
/// Exits non-zero when the file exists but does not parse, so service
/// managers can use this as a pre-flight check.
pub async fn run(config_path: &str) -> Result<()> {
    let config = Config::load(config_path).await?;
    let storage_path = config::resolve_path(Path::new(config_path), &config.storage.path);

    let credentials = if config.remote.consumer_key.is_empty()
        || config.remote.consumer_secret.is_empty()
    {
        "missing"
    } else {
        "configured"
    };
    let status_server = if config.status_server.enabled {
        config.status_server.addr()
    } else {
        "disabled".to_string()
    };

    println!("configuration: {config_path}");
    println!("  transport link:       {}", config.link.addr());
    println!("  status server:        {status_server}");
    println!("  remote api:           {}", config.remote.api_base);
    println!("  consumer credentials: {credentials}");
    println!(
        "  polling:              statuses every {}s, direct messages every {}s, {} worker slots",
        config.polling.status_interval_secs,
        config.polling.direct_message_interval_secs,
        config.polling.worker_slots,
    );
    println!("  user records:         {}", storage_path.display());
    println!(
        "  session defaults:     {} mode, chatroom {}",
        config.defaults.mode, config.defaults.chatroom_name,
    );

    if credentials == "missing" {
        println!();
        println!("warning: consumer key or secret is not set; sign-in will fail");
    }

    Ok(())
}
