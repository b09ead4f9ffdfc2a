pub mod file_manager;
pub mod piece;
