// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use clap::Parser;
use dotenv::dotenv;
use stonenet::{
    setup_local_tracing, setup_tracing, Acceptor, AppResult, Bound, ConnectionRegistry, Connector,
    FilterContext, FrameDecoder, FrameEncoder, IoHandler, NetConfig,
};
use tokio::{runtime, signal, time};
use tracing::{error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(version, about = "length-prefixed echo server and client")]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// also write hourly rolling log files into this directory
    #[arg(long)]
    pub log_dir: Option<String>,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// echo every frame back to its sender
    Server {
        /// overrides the configured listen port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// send a numbered frame to the server periodically
    Client {
        /// server address, host:port
        #[arg(short, long, default_value = "127.0.0.1:6666")]
        addr: String,
        /// seconds between two frames
        #[arg(short, long, default_value_t = 1)]
        interval: u64,
    },
    PrintConfig,
}

fn log_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();

    let _log_guard = match &commandline.log_dir {
        Some(log_dir) => Some(setup_tracing(log_dir, log_directive(commandline.verbose))?),
        None => {
            if commandline.verbose > 0 && std::env::var_os("RUST_LOG").is_none() {
                std::env::set_var("RUST_LOG", log_directive(commandline.verbose));
            }
            setup_local_tracing()?;
            None
        }
    };

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let mut config = if config_path.exists() {
        NetConfig::set_up_config(&config_path)?
    } else {
        warn!("config file {:?} not found, use defaults", config_path);
        NetConfig::default()
    };

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    match commandline.command {
        Command::Server { port } => {
            if let Some(port) = port {
                config.acceptor.port = port;
            }
            rt.block_on(run_server(config))
        }
        Command::Client { addr, interval } => rt.block_on(run_client(config, addr, interval)),
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}

async fn run_server(config: NetConfig) -> AppResult<()> {
    let registry = Arc::new(ConnectionRegistry::new());
    let acceptor = Acceptor::new(config.acceptor.clone());
    let chain = acceptor.filter_chain();
    chain.add_last(
        "FrameDecoder",
        FrameDecoder::from_config(&config.codec)?.into_handler(),
    );
    chain.add_last(
        "FrameEncoder",
        FrameEncoder::from_config(&config.codec)?.into_handler(),
    );
    chain.add_last(
        "EchoSession",
        EchoSession {
            registry: registry.clone(),
        },
    );

    let addr = acceptor.start().await?;
    info!("echo server listening on {}", addr);

    signal::ctrl_c().await?;
    info!(
        "received ctrl-c, closing {} connections",
        registry.size()
    );
    acceptor.stop();
    acceptor.wait_for_stop().await;
    info!("echo server exit");
    Ok(())
}

async fn run_client(config: NetConfig, addr: String, interval: u64) -> AppResult<()> {
    let connector = Connector::new("echo-client", config.connector.clone());
    let chain = connector.filter_chain();
    chain.add_last(
        "FrameDecoder",
        FrameDecoder::from_config(&config.codec)?.into_handler(),
    );
    chain.add_last(
        "FrameEncoder",
        FrameEncoder::from_config(&config.codec)?.into_handler(),
    );
    chain.add_last(
        "ClientSession",
        ClientSession {
            connector: connector.clone(),
            addr: addr.clone(),
        },
    );
    connector.async_connect(addr);

    let mut ticker = time::interval(Duration::from_secs(interval.max(1)));
    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connector.is_connected() {
                    seq += 1;
                    connector.write(BytesMut::from(format!("tick {}", seq).as_bytes()));
                }
            }
            res = signal::ctrl_c() => {
                res?;
                break;
            }
        }
    }

    connector.stop();
    connector.wait_for_stop().await;
    info!("echo client exit");
    Ok(())
}

struct EchoSession {
    registry: Arc<ConnectionRegistry>,
}

impl IoHandler for EchoSession {
    fn bound(&self) -> Bound {
        Bound::INBOUND
    }

    fn conn_opened(&self, ctx: &FilterContext<'_>) {
        if let Some(conn) = ctx.connection() {
            self.registry.add_con(conn);
            info!("connection[{}] id {} opened", conn.remote_addr(), conn.id());
            conn.write(BytesMut::from(&b"welcome"[..]));
        }
    }

    fn conn_closed(&self, ctx: &FilterContext<'_>) {
        if let Some(conn) = ctx.connection() {
            self.registry.remove_con(conn);
            info!("connection[{}] id {} closed", conn.remote_addr(), conn.id());
        }
    }

    fn message_received(&self, ctx: &FilterContext<'_>, msg: &mut BytesMut) {
        if let Some(conn) = ctx.connection() {
            conn.write(msg.split());
        }
    }

    fn clone_handler(&self) -> Box<dyn IoHandler> {
        Box::new(EchoSession {
            registry: self.registry.clone(),
        })
    }
}

struct ClientSession {
    connector: Connector,
    addr: String,
}

impl IoHandler for ClientSession {
    fn bound(&self) -> Bound {
        Bound::INBOUND
    }

    fn conn_opened(&self, _ctx: &FilterContext<'_>) {
        info!("connected to {}", self.addr);
    }

    fn conn_closed(&self, _ctx: &FilterContext<'_>) {
        error!(
            "connection to {} lost, reconnect in {:?}",
            self.addr, RECONNECT_DELAY
        );
        let connector = self.connector.clone();
        let addr = self.addr.clone();
        tokio::spawn(async move {
            time::sleep(RECONNECT_DELAY).await;
            connector.async_connect(addr);
        });
    }

    fn message_received(&self, _ctx: &FilterContext<'_>, msg: &mut BytesMut) {
        info!("echo: {}", String::from_utf8_lossy(&msg.split()));
    }

    fn clone_handler(&self) -> Box<dyn IoHandler> {
        Box::new(ClientSession {
            connector: self.connector.clone(),
            addr: self.addr.clone(),
        })
    }
}
