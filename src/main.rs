//! Demo binary: a consumer and a provider exchange a payload over a tunnel
//! stream carried by an in-process duplex pipe.
//!
//! The provider echoes every message it receives and closes the stream after
//! the last echo; the consumer prints what comes back and exits once the
//! provider's close completes.

mod cli;

use clap::Parser;
use tracing::info;
use tunnelframe::{
    ClassOfService,
    Connection,
    ConnectionError,
    ContainerTag,
    DataState,
    Event,
    FramedConnection,
    Multiplexer,
    OpenParams,
    Role,
    TunnelCodec,
    TunnelConfig,
};

async fn run_consumer(mut mux: Multiplexer<FramedConnection>, cli: &cli::Cli) -> tunnelframe::Result<()> {
    let cos = ClassOfService::default()
        .with_max_msg_size(cli.max_msg_size)
        .with_max_fragment_size(cli.max_fragment_size);
    let handle = mux.open(&OpenParams::new(cli.name.clone()).with_cos(cos))?;

    loop {
        let events = mux.wait().await;
        if events.is_empty() && !mux.connection().is_usable() {
            return Err(ConnectionError::Closed.into());
        }
        for event in events {
            match event {
                Event::Status { state, .. } if state.is_open() && state.data == DataState::Ok => {
                    info!(stream = %handle.id(), "stream open");
                    for _ in 0..cli.repeat {
                        mux.submit_bytes(handle, cli.payload.clone(), ContainerTag::Opaque)?;
                    }
                }
                Event::Status { state, .. } if state.is_open() => {
                    info!(stream = %handle.id(), text = %state.text, "stream suspect");
                }
                Event::Status { state, .. } => {
                    info!(stream = %handle.id(), text = %state.text, "stream closed");
                    return Ok(());
                }
                Event::Message { payload, .. } => {
                    println!("{}", String::from_utf8_lossy(&payload));
                }
                Event::Accepted { .. } => {}
            }
        }
    }
}

async fn run_provider(mut mux: Multiplexer<FramedConnection>, repeat: usize) -> tunnelframe::Result<()> {
    let mut echoed = 0;
    loop {
        let events = mux.wait().await;
        if events.is_empty() && !mux.connection().is_usable() {
            return Err(ConnectionError::Closed.into());
        }
        for event in events {
            match event {
                Event::Accepted { handle, info } => {
                    info!(
                        stream = %handle.id(),
                        name = %String::from_utf8_lossy(&info.name),
                        "accepted stream"
                    );
                }
                Event::Message {
                    handle,
                    tag,
                    payload,
                } => {
                    mux.submit_bytes(handle, payload, tag)?;
                    echoed += 1;
                    if echoed == repeat {
                        mux.close(handle, true);
                    }
                }
                Event::Status { state, .. } if state.is_open() => {}
                Event::Status { handle, state } => {
                    info!(stream = %handle.id(), text = %state.text, "provider finished");
                    return Ok(());
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> tunnelframe::Result<()> {
    // Enable structured logging for the demo.
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    let config = TunnelConfig::default();
    let (consumer_io, provider_io) = tokio::io::duplex(64 * 1024);
    let consumer = Multiplexer::new(
        FramedConnection::spawn(consumer_io, TunnelCodec::new(config.max_frame_length)),
        Role::Consumer,
        config.clone(),
    );
    let provider = Multiplexer::new(
        FramedConnection::spawn(provider_io, TunnelCodec::new(config.max_frame_length)),
        Role::Provider,
        config,
    );

    tokio::try_join!(run_consumer(consumer, &cli), run_provider(provider, cli.repeat))?;
    Ok(())
}
