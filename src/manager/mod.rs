pub mod ledger;
pub mod link;
pub mod listener;
pub mod rarity;
pub mod scheduler;
pub mod torrent_manager;
