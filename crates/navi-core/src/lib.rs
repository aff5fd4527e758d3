pub mod errors;
pub mod events;
pub mod ids;
pub mod reasoning;
pub mod results;
pub mod roles;
pub mod tools;
pub mod wire;
