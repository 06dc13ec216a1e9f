pub mod actuator;
pub mod capture;
pub mod controller;
pub mod errors;
pub mod faces;
