//! SeaORM entities.

pub mod authorization_code;
pub mod oauth2_client;
pub mod session;
pub mod user;
