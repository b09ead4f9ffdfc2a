pub mod infodict;
pub mod metainfo;
