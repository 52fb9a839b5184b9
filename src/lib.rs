pub mod codec;
pub mod config;
pub mod data;
pub mod errors;
pub mod etl;
pub mod map_data;
pub mod persist;
pub mod session;
pub mod spatial;
pub mod sync;
pub mod undo;
