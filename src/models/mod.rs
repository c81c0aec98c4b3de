pub mod consultation;
pub mod enums;

pub use consultation::*;
pub use enums::*;
