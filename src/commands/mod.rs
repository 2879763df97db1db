pub mod controller;
pub mod fleet;
pub mod supervisor;
