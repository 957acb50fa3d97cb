pub mod audit;
pub mod rbac;
pub mod token;
pub mod user;
