use std::path::PathBuf;

use clap::{Parser, Subcommand};

use blobstore::client::Client;
use blobstore::key::Key;
use blobstore::protocol::{DEFAULT_QUERY_PORT, DEFAULT_READ_PORT, DEFAULT_WRITE_PORT};

#[derive(Parser)]
#[command(name = "blobstore-client", about = "Talk to a blobstore-server instance")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = DEFAULT_QUERY_PORT)]
    query_port: u16,

    #[arg(long, default_value_t = DEFAULT_READ_PORT)]
    read_port: u16,

    #[arg(long, default_value_t = DEFAULT_WRITE_PORT)]
    write_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check whether a key is already stored (hex-encoded, 64 chars)
    Is { key: String },
    /// Upload a file's contents under the given key
    Write { key: String, file: PathBuf },
    /// Download the block for a key to a file
    Read { key: String, file: PathBuf },
}

fn parse_key(hex_str: &str) -> anyhow::Result<Key> {
    let bytes = hex::decode(hex_str)?;
    Key::from_slice(&bytes).ok_or_else(|| anyhow::anyhow!("key must be exactly 32 bytes"))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut client = Client::connect(
        (cli.host.as_str(), cli.query_port),
        (cli.host.as_str(), cli.read_port),
        (cli.host.as_str(), cli.write_port),
    )?;

    match cli.command {
        Command::Is { key } => {
            let key = parse_key(&key)?;
            println!("{}", client.is(&key)?);
        }
        Command::Write { key, file } => {
            let key = parse_key(&key)?;
            let payload = std::fs::read(&file)?;
            let written = client.write(&key, &payload)?;
            println!("wrote {} bytes", written);
        }
        Command::Read { key, file } => {
            let key = parse_key(&key)?;
            let payload = client.read(&key)?;
            std::fs::write(&file, &payload)?;
            println!("read {} bytes", payload.len());
        }
    }

    Ok(())
}
