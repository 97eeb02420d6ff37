pub mod indicators;
pub mod signals;
