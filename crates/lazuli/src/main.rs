use lazuli_log::LazuliLogger;
use lazurite::{Connection, Mux, PublicKey};
use log::{Level, error, info, logger, warn};
use std::env;
use std::process::ExitCode;
use tokio::time::Instant;

mod config;

#[tokio::main]
async fn main() -> ExitCode {
    LazuliLogger::init(Level::Info).unwrap();

    let config = match config::handle() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            logger().flush();
            return ExitCode::FAILURE;
        }
    };

    let args: Vec<String> = env::args().collect();
    let result = match args.get(1).map(String::as_str) {
        None | Some("serve") => serve(config).await,
        Some("echo") if args.len() == 4 => echo(config, &args[2], &args[3]).await,
        _ => {
            error!("usage: lazuli [serve | echo <address> <server-public-key-hex>]");
            logger().flush();
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => {
            logger().flush();
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            logger().flush();
            ExitCode::FAILURE
        }
    }
}

/// Accepts connections forever, echoing both channels back at each peer.
async fn serve(config: config::Config) -> lazurite::Result<()> {
    let transport = config.transport_config(true);
    info!("server public key: {}", transport.private_key.public());

    let mux = Mux::listen(config.network.address.parse().expect("validated"), transport).await?;

    loop {
        let conn = mux.accept().await?;
        conn.set_msg_receive_window(config.transport.msg_receive_window);
        info!("accepted connection from {}", conn.peer_addr());
        tokio::spawn(echo_peer(conn));
    }
}

async fn echo_peer(conn: Connection) {
    let stream = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = match conn.read(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => break e,
                };
                if let Err(e) = conn.write(&buf[..n]).await {
                    break e;
                }
            }
        })
    };

    let msgs = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = match conn.read_msg(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => break e,
                };
                if let Err(e) = conn.write_msg(&buf[..n]).await {
                    break e;
                }
            }
        })
    };

    let reason = stream.await.expect("echo task");
    let _ = msgs.await;
    info!("connection to {} finished: {reason}", conn.peer_addr());
}

/// Connects to an echo server, pushes a test payload through both
/// channels and reports throughput.
async fn echo(
    config: config::Config,
    address: &str,
    server_public_key_hex: &str,
) -> lazurite::Result<()> {
    let key_bytes: [u8; 32] = hex::decode(server_public_key_hex)
        .ok()
        .and_then(|k| k.try_into().ok())
        .ok_or(lazurite::Error::Handshake("bad server public key"))?;
    let server_key = PublicKey::from_bytes(key_bytes);

    let mux = Mux::listen("0.0.0.0:0".parse().expect("literal"), config.transport_config(false))
        .await?;

    let start = Instant::now();
    let conn = lazurite::dial(&mux, address, server_key).await?;
    conn.set_msg_receive_window(config.transport.msg_receive_window);
    info!("connected to {} in {:?}", conn.peer_addr(), start.elapsed());

    let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|_| rand::random()).collect();

    let writer = {
        let conn = conn.clone();
        let payload = payload.clone();
        tokio::spawn(async move { conn.write(&payload).await })
    };

    let start = Instant::now();
    let mut echoed = Vec::with_capacity(payload.len());
    let mut buf = vec![0u8; 64 * 1024];
    while echoed.len() < payload.len() {
        let n = conn.read(&mut buf).await?;
        echoed.extend_from_slice(&buf[..n]);
    }
    writer.await.expect("writer task")?;

    let elapsed = start.elapsed();
    if echoed != payload {
        warn!("echoed stream does not match what was sent");
    }
    info!(
        "echoed {} KiB in {:.2?} ({:.2} MiB/s round trip)",
        payload.len() / 1024,
        elapsed,
        payload.len() as f64 / 1024.0 / 1024.0 / elapsed.as_secs_f64()
    );

    conn.write_msg(b"unreliable hello").await?;
    let n = conn.read_msg(&mut buf).await?;
    info!("message echo: {:?}", String::from_utf8_lossy(&buf[..n]));

    conn.close().await;
    Ok(())
}
