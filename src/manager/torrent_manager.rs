use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;

use crate::manager::listener::{Listener, TcpDialer};
use crate::manager::scheduler::{Scheduler, SchedulerConfig};
use crate::metadata::metainfo::Metainfo;
use crate::persistence::file_manager::FileManager;
use crate::tracker::{Announcer, Progress, TrackerClient};
use crate::util::{force_string, generate_peer_id, pretty_info_hash};

const NEW_LINKS_CHANNEL_CAPACITY: usize = 64;
const COMPLETION_CHECK_FREQ: Duration = Duration::from_secs(1);

pub struct SessionConfig {
    pub port: u16,
    pub max_peers: usize,
    pub upload: bool,
}

/// Wires storage, announces, the accept loop and the scheduler together for
/// one torrent and tears them down in order.
pub struct TorrentManager {
    metainfo: Metainfo,
    base_path: PathBuf,
    config: SessionConfig,
}

impl TorrentManager {
    pub fn new(metainfo: Metainfo, base_path: PathBuf, config: SessionConfig) -> Self {
        TorrentManager {
            metainfo,
            base_path,
            config,
        }
    }

    /// Runs until the download completes (when not uploading) or Ctrl-C.
    pub async fn start(self) -> Result<()> {
        let info_hash = self.metainfo.info_hash();
        let storage = Arc::new(FileManager::from_metainfo(&self.base_path, &self.metainfo)?);
        let own_peer_id = generate_peer_id();
        log::info!(
            "starting torrent {}, own peer id: {}",
            pretty_info_hash(info_hash),
            force_string(&own_peer_id)
        );

        let (links_tx, links_rx) = mpsc::channel(NEW_LINKS_CHANNEL_CAPACITY);
        let listener = Listener::bind(
            self.config.port,
            info_hash,
            own_peer_id,
            storage.clone(),
            links_tx.clone(),
        )
        .await?;
        log::info!("listening for peers on {}", listener.local_addr()?);
        let tracker_client = TrackerClient::new(
            own_peer_id,
            self.metainfo.announce_urls().clone(),
            self.config.port,
        )?;
        let (announcer, announce_handle) = Announcer::new(
            tracker_client,
            info_hash,
            Progress {
                downloaded: 0,
                uploaded: 0,
                left: storage.bytes_left(),
            },
        );
        let scheduler = Scheduler::new(
            storage.clone(),
            announce_handle,
            TcpDialer::new(info_hash, own_peer_id, links_tx),
            links_rx,
            SchedulerConfig {
                max_peers: self.config.max_peers,
                upload: self.config.upload,
            },
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let (stop_announcer_tx, stop_announcer_rx) = watch::channel(false);
        let listener_task = tokio::spawn(listener.run(stop_rx.clone()));
        let scheduler_task = tokio::spawn(scheduler.run(stop_rx));
        let announcer_task = tokio::spawn(announcer.run(stop_announcer_rx));

        self.wait_for_end(&storage).await;

        log::info!("shutting down...");
        stop_tx.send_replace(true);
        if let Err(e) = listener_task.await {
            log::error!("accept loop failed: {e}");
        }
        if let Err(e) = scheduler_task.await {
            log::error!("scheduler failed: {e}");
        }
        stop_announcer_tx.send_replace(true);
        match announcer_task.await {
            Ok(announcer) => announcer.stop().await,
            Err(e) => log::error!("announce task failed: {e}"),
        }
        storage.close()?;
        log::info!("bye");
        Ok(())
    }

    async fn wait_for_end(&self, storage: &FileManager) {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut check = interval(COMPLETION_CHECK_FREQ);
        loop {
            tokio::select! {
                r = &mut ctrl_c => {
                    match r {
                        Ok(()) => log::info!("interrupted"),
                        Err(e) => log::error!("could not listen for Ctrl-C: {e}"),
                    }
                    return;
                }
                _ = check.tick() => {
                    if !self.config.upload && storage.is_complete() {
                        log::info!("download complete, not seeding");
                        return;
                    }
                }
            }
        }
    }
}
