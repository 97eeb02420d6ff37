pub mod backfill;
pub mod live;
pub mod okx;
pub mod series;
pub mod session;
pub mod types;
