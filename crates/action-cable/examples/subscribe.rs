//! Subscribe to an Action Cable channel and print what it broadcasts.
//!
//! ```sh
//! cargo run -p action-cable --example subscribe -- <URL> <CHANNEL> [KEY=VALUE ...]
//! ```
//!
//! e.g. `subscribe ws://localhost:3000/cable ChatChannel room=lobby`.
//! Set `CABLE_ORIGIN` if the server checks the Origin header.
//! Payloads are printed to stdout (pipe to `jq` for formatting). Ctrl-C
//! unsubscribes and exits.

use action_cable::{Channel, Consumer, ConsumerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let usage = "usage: subscribe <URL> <CHANNEL> [KEY=VALUE ...]";
    let args: Vec<String> = std::env::args().skip(1).collect();
    let url = args.first().ok_or(usage)?;
    let name = args.get(1).ok_or(usage)?;

    let mut channel = Channel::new(name.as_str());
    for param in args.iter().skip(2) {
        let (key, value) = param
            .split_once('=')
            .ok_or("channel params must be KEY=VALUE")?;
        channel = channel.with_param(key, value);
    }

    let mut config = ConsumerConfig::new(url.as_str());
    if let Ok(origin) = std::env::var("CABLE_ORIGIN") {
        config.headers.insert("Origin".to_string(), origin);
    }
    let consumer = Consumer::new(config)?;

    eprintln!("subscribing to {} ...", channel.identifier());
    consumer
        .subscriptions()
        .create(&channel)
        .on_connected(|| eprintln!("[connected]"))
        .on_disconnected(|| eprintln!("[disconnected]"))
        .on_rejected(|| eprintln!("[rejected]"))
        .on_failed(|e| eprintln!("[error] {e}"))
        .on_received(|payload| println!("{payload}"));
    consumer.connect();

    tokio::signal::ctrl_c().await?;
    eprintln!("unsubscribing ...");
    consumer.unsubscribe_and_disconnect().await;
    Ok(())
}
