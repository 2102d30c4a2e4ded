use std::{env, net::SocketAddr, sync::Arc};

use bittorrent::{ClientConfig, TorrentConfig, TorrentModel, TorrentTask};

const DEFAULT_PORT: u16 = 6881;

#[tokio::main]
async fn main() {
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let path = env::args().nth(1).expect("usage: bittorrent <torrent-file>");
    let metainfo = TorrentModel::from_path(&path).expect("failed to parse torrent file");

    let client_config = Arc::new(ClientConfig::default());
    let torrent_config = TorrentConfig {
        listen_address: SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), DEFAULT_PORT),
        ..TorrentConfig::default()
    };

    let mut task = TorrentTask::new(&metainfo, client_config, torrent_config)
        .await
        .expect("failed to initialise torrent task");

    if let Err(e) = task.start().await {
        tracing::error!("{}", e);
    }
}
