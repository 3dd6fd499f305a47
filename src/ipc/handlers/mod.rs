pub mod attendance;
pub mod classes;
pub mod core;
pub mod enrollments;
pub mod links;
pub mod stats;
pub mod students;
pub mod tenants;
