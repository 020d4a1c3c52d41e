pub mod routes;
pub mod validate;
