pub mod aws;
pub mod size;

pub use size::human_readable_size;
