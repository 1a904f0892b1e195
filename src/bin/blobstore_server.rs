use std::path::PathBuf;

use clap::Parser;
use log::info;

use blobstore::image::{Image, ImageOptions};
use blobstore::server::{Server, ServerOptions};

#[derive(Parser)]
#[command(name = "blobstore-server", about = "Serve a block store image over TCP")]
struct Cli {
    /// Image root directory (holds index.db, image.dat, lock.db)
    root: PathBuf,

    #[arg(long, default_value_t = blobstore::protocol::DEFAULT_QUERY_PORT)]
    query_port: u16,

    #[arg(long, default_value_t = blobstore::protocol::DEFAULT_READ_PORT)]
    read_port: u16,

    #[arg(long, default_value_t = blobstore::protocol::DEFAULT_WRITE_PORT)]
    write_port: u16,

    /// Worker threads per channel
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Use the unbuffered write path (reads straight into the mapped
    /// region; fragile across a mid-body disconnect)
    #[arg(long)]
    unbuffered_writes: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let image = Image::open_with(&cli.root, ImageOptions::default())?;
    info!("image opened at {:?}", cli.root);

    let opts = ServerOptions {
        query_port: cli.query_port,
        read_port: cli.read_port,
        write_port: cli.write_port,
        threads: cli.threads,
        buffered_writes: !cli.unbuffered_writes,
    };

    let server = Server::start(image, opts)?;
    info!(
        "listening: query={} read={} write={}",
        cli.query_port, cli.read_port, cli.write_port
    );

    // Runs until the process is terminated; `server.shutdown()` is
    // the cooperative stop path for embedders, not wired to a signal
    // here.
    server.join();
    Ok(())
}
