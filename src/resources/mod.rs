mod mk;

pub use mk::*;
