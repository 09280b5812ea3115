use crate::client::{ClientConfig, DownloadOptions, TorrentClient};
use crate::error::Result;
use crate::torrent::TorrentDescriptor;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "bitswarm")]
#[command(about = "A BitTorrent client written in Rust", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a torrent file
    Download {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,

        /// Download directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Maximum number of peers to connect to
        #[arg(short, long)]
        max_peers: Option<usize>,

        /// Extra peer address to connect to (repeatable)
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Re-hash existing data before downloading
        #[arg(long)]
        recheck: bool,

        /// Download pieces in order
        #[arg(long)]
        sequential: bool,
    },

    /// Show information about a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Download {
                torrent,
                output,
                port,
                max_peers,
                peers,
                config,
                recheck,
                sequential,
            } => {
                let mut client_config = match config {
                    Some(path) => ClientConfig::load(path).await?,
                    None => ClientConfig::default(),
                };
                if let Some(output) = output {
                    client_config.download_dir = output.clone();
                }
                if let Some(port) = port {
                    client_config.listen_port = *port;
                }
                if let Some(max_peers) = max_peers {
                    client_config.max_peers = *max_peers;
                }
                if *sequential {
                    client_config.sequential = true;
                }

                let options = DownloadOptions {
                    extra_peers: peers.clone(),
                    recheck: *recheck,
                };

                let client = TorrentClient::new(client_config);
                client.download(torrent, options).await?;
            }

            Commands::Info { torrent } => {
                show_torrent_info(torrent).await?;
            }
        }

        Ok(())
    }
}

async fn show_torrent_info(torrent_path: &Path) -> Result<()> {
    let descriptor = crate::torrent::load_torrent_file(torrent_path).await?;
    print!("{}", describe(&descriptor));
    Ok(())
}

fn describe(descriptor: &TorrentDescriptor) -> String {
    let mut out = String::new();

    out.push_str("Torrent Information\n");
    out.push_str("==================\n");
    out.push_str(&format!("Name: {}\n", descriptor.name));
    out.push_str(&format!("Tracker: {}\n", descriptor.announce));
    out.push_str(&format!("Total Size: {} bytes\n", descriptor.total_length));
    out.push_str(&format!("Piece Length: {} bytes\n", descriptor.piece_length));
    out.push_str(&format!("Number of Pieces: {}\n", descriptor.piece_count()));
    out.push_str(&format!("Info Hash: {}\n", descriptor.info_hash_hex()));
    out.push_str("\nFiles:\n");

    for (i, file) in descriptor.files.iter().enumerate() {
        out.push_str(&format!(
            "  {}: {} ({} bytes)\n",
            i + 1,
            file.path.join("/"),
            file.length
        ));
    }

    if !descriptor.announce_list.is_empty() {
        out.push_str("\nAdditional Trackers:\n");
        for tracker in &descriptor.announce_list {
            out.push_str(&format!("  - {}\n", tracker));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::fixtures;

    #[test]
    fn test_describe_multi_file() {
        let descriptor = fixtures::multi_file("album", &[5, 3], b"ABCDEFGH", 4);
        let text = describe(&descriptor);

        assert!(text.contains("Name: album"));
        assert!(text.contains("Number of Pieces: 2"));
        assert!(text.contains("  1: f0 (5 bytes)"));
        assert!(text.contains("  2: f1 (3 bytes)"));
        assert!(!text.contains("Additional Trackers"));
    }

    #[test]
    fn test_download_flags() {
        let cli = Cli::try_parse_from([
            "bitswarm",
            "download",
            "--torrent",
            "a.torrent",
            "--peer",
            "10.0.0.1:6881",
            "--peer",
            "10.0.0.2:6881",
            "--recheck",
        ])
        .unwrap();

        match cli.command {
            Commands::Download {
                peers,
                recheck,
                port,
                ..
            } => {
                assert_eq!(peers.len(), 2);
                assert!(recheck);
                assert_eq!(port, None);
            }
            Commands::Info { .. } => panic!("expected download"),
        }
    }
}
