pub mod installer;
pub mod preflight;
pub mod routes;
