pub mod sweep;
pub mod sync;
