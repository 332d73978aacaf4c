pub mod audit;
pub mod location;
pub mod order;
pub mod route;
