pub mod bucket;
pub mod config;
pub mod coarse;
pub mod directory;
pub mod fine;
pub mod header;

pub use bucket::{Bucket, InsertResult};
pub use coarse::CoarseEht;
pub use config::EhtConfig;
pub use directory::Directory;
pub use fine::FineGrainedEht;
pub use header::Header;
