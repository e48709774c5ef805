mod config;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use config::ServerConfig;
use pipeline::adapters::mock::{MockAsr, MockMt, MockTts};
use session::Adapters;

#[derive(Parser, Debug)]
#[command(name = "server")]
struct Args {
    #[arg(short, long, help = "address to listen on, overrides S2ST_BIND_HOST")]
    address: Option<String>,

    #[arg(short, long, help = "port to listen on, overrides S2ST_BIND_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut server_config = ServerConfig::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(server_config.log_level.clone())
        .init();

    let args = Args::parse();
    if let Some(address) = args.address {
        server_config.bind_host = address;
    }
    if let Some(port) = args.port {
        server_config.bind_port = port;
    }
    let server_config = Arc::new(server_config);

    let addr: SocketAddr = format!("{}:{}", server_config.bind_host, server_config.bind_port).parse()?;

    // Real ASR/MT/TTS backends are out of scope here; wire your own
    // `AsrAdapter`/`MtAdapter`/`TtsAdapter` impls in their place.
    info!(asr_model = %server_config.asr_model, mt_model = %server_config.mt_model, tts_model = %server_config.tts_model, "using mock adapters");
    let adapters = Arc::new(Adapters {
        asr: Arc::new(MockAsr {
            fixed_reply: "this is a mock transcription".to_string(),
        }),
        mt: Arc::new(MockMt),
        tts: Arc::new(MockTts {
            sample_rate: shared_protocol::OUTBOUND_SAMPLE_RATE,
        }),
    });

    info!("listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!(%peer_addr, "connection accepted");
        let server_config = Arc::clone(&server_config);
        let adapters = Arc::clone(&adapters);
        tokio::spawn(async move {
            if let Err(e) = session::handle_connection(stream, server_config, adapters).await {
                error!(error = %e, "connection error");
            }
        });
    }
    Ok(())
}
