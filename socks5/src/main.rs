use anyhow::Result;
use clap::Parser;
use log::info;
use std::net::Ipv4Addr;

use socks5::config::{self, Config};
use socks5::Server;

#[derive(Parser)]
#[command(name = "socks5")]
#[command(about = "Single-threaded SOCKS5 proxy server")]
struct Args {
    /// Port to listen on
    port: u16,

    /// Bind address, takes precedence over --interface
    #[arg(short, long)]
    bind: Option<Ipv4Addr>,

    /// Network interface whose first IPv4 address is used for binding
    #[arg(short, long, default_value = config::DEFAULT_INTERFACE)]
    interface: String,

    /// Listen backlog
    #[arg(long, default_value_t = config::DEFAULT_BACKLOG)]
    backlog: i32,

    /// Relay buffer size in bytes
    #[arg(long, default_value_t = config::DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = Config {
        bind: config::resolve_bind(args.bind, &args.interface),
        port: args.port,
        backlog: args.backlog,
        buffer_size: args.buffer_size,
    };

    let server = Server::bind(config)?;
    server.watch_signals();
    server.run()?;

    info!("服务器已退出");
    Ok(())
}
