pub mod recompute;
pub mod status;
