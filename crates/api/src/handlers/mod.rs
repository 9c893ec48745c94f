pub mod generation;
pub mod hosted;
pub mod training;
