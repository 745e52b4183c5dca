use anyhow::Result;
use clap::{Parser, Subcommand};
use gsock::prelude::*;
use gsock::telemetry;
use std::net::SocketAddr;
use tokio::io::duplex;
use tracing::{debug, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "gsockd")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Overrides logging.level from the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as JSON
    Config,

    /// Exchange messages between two in-memory WebSockets
    WsLoopback {
        #[arg(short, long, default_value_t = 3)]
        messages: usize,

        #[arg(short, long, default_value = "hello")]
        text: String,

        /// Negotiate permessage-deflate on both ends
        #[arg(long)]
        compress: bool,
    },

    /// Drive a connection and stream through the recording engine
    QuicSim {
        #[arg(short, long, default_value = "127.0.0.1:4433")]
        remote: SocketAddr,

        #[arg(short, long, default_value = "ping")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GsockConfig::load(cli.config.as_deref())?;

    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    telemetry::init(&level);

    info!("gsockd v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::WsLoopback {
            messages,
            text,
            compress,
        } => {
            info!("Running WebSocket loopback with {} messages", messages);
            run_ws_loopback(&config, messages, &text, compress).await?;
        }

        Commands::QuicSim { remote, message } => {
            info!("Simulating QUIC exchange with {}", remote);
            run_quic_sim(&config, remote, &message).await?;
        }
    }

    Ok(())
}

async fn receive_message<S>(socket: &WebSocket<S>) -> Result<(MessageType, Vec<u8>)>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let mut buf = vec![0u8; 4096];
    let mut message = Vec::new();
    loop {
        let result = socket.receive(&mut buf).await?;
        message.extend_from_slice(&buf[..result.count]);
        if result.end_of_message {
            return Ok((result.message_type, message));
        }
    }
}

async fn run_ws_loopback(config: &GsockConfig, messages: usize, text: &str, compress: bool) -> Result<()> {
    let (client_io, server_io) = duplex(64 * 1024);
    let mut client_options = config.websocket_options(Role::Client);
    let mut server_options = config.websocket_options(Role::Server);
    if compress {
        let deflate = client_options.deflate.unwrap_or_default();
        client_options.deflate = Some(deflate);
        server_options.deflate = Some(deflate);
    }
    let client = WebSocket::new(client_io, client_options)?;
    let server = WebSocket::new(server_io, server_options)?;

    for i in 0..messages {
        let outgoing = format!("{} #{}", text, i);
        client
            .send(outgoing.as_bytes(), MessageType::Text, SendFlags::END_OF_MESSAGE)
            .await?;

        let (message_type, echoed) = receive_message(&server).await?;
        server.send(&echoed, message_type, SendFlags::END_OF_MESSAGE).await?;

        let (_, reply) = receive_message(&client).await?;
        println!("{}", String::from_utf8_lossy(&reply));
    }

    let server_side = async {
        let (message_type, _) = receive_message(&server).await?;
        debug!("server received {:?}", message_type);
        server.close_output(CloseStatus::NORMAL_CLOSURE, "").await?;
        Ok::<_, anyhow::Error>(())
    };
    let (closed, answered) = tokio::join!(client.close(CloseStatus::NORMAL_CLOSURE, "done"), server_side);
    closed?;
    answered?;

    println!(
        "client {} ({}), server {} ({})",
        client.state(),
        client.close_status().map(|status| status.to_string()).unwrap_or_default(),
        server.state(),
        server.close_status().map(|status| status.to_string()).unwrap_or_default(),
    );
    Ok(())
}

async fn run_quic_sim(config: &GsockConfig, remote: SocketAddr, message: &str) -> Result<()> {
    let engine = RecordingEngine::new();
    let registration = Registration::open(engine.clone(), "gsockd")?;
    let cancel = CancellationToken::new();

    let connection = Connection::connect_with(&registration, config.client_options(remote), &cancel).await?;
    info!(
        "{} connected, alpn {:?}",
        connection.trace_id(),
        connection
            .negotiated_application_protocol()
            .map(|alpn| String::from_utf8_lossy(&alpn).into_owned())
    );

    let stream = connection.open_bidirectional_stream()?;
    stream.write(message.as_bytes(), true, &cancel).await?;
    engine.fire_receive(stream.raw_handle(), message.as_bytes(), true);

    let mut buf = vec![0u8; 1024];
    let mut reply = Vec::new();
    loop {
        let n = stream.read(&mut buf, &cancel).await?;
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
    }
    println!("echo: {}", String::from_utf8_lossy(&reply));

    drop(stream);
    connection
        .close(config.connection.default_close_error_code, &cancel)
        .await?;
    drop(connection);

    for call in engine.calls() {
        println!("{:?}", call);
    }
    Ok(())
}
