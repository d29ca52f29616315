//! Command line interface for the `tunnelframe` demo binary.

use clap::Parser;

/// Command line arguments for the `tunnelframe` binary.
#[derive(Debug, Parser)]
#[command(
    name = "tunnelframe",
    version,
    about = "Echo a payload over a tunnel stream between two in-process endpoints"
)]
pub struct Cli {
    /// Payload sent by the consumer and echoed back by the provider.
    #[arg(short, long, default_value = "PETER CAPALDI")]
    pub payload: String,
    /// Name of the stream to open.
    #[arg(short, long, default_value = "TUNNEL")]
    pub name: String,
    /// Largest message the consumer requests, in bytes.
    #[arg(long, default_value_t = 614_400)]
    pub max_msg_size: usize,
    /// Largest fragment the consumer requests, in bytes.
    #[arg(long, default_value_t = 6144)]
    pub max_fragment_size: usize,
    /// How many times to send the payload. Bounded by the per-stream
    /// buffer allowance, since every copy is queued at once.
    #[arg(
        short,
        long,
        default_value_t = 1,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..=50)
    )]
    pub repeat: usize,
}
